use async_trait::async_trait;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::{Client, Collection};
use tracing::debug;

use crate::{ArchiveError, ArchiveStore, MessageRecord, Result, StoreOutcome};

const COLLECTION: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth_database: String,
    pub database: String,
}

/// Schema-less archive: one document per message in the `data` collection.
#[derive(Clone)]
pub struct MongoArchiveStore {
    client: Client,
    collection: Collection<Document>,
}

impl MongoArchiveStore {
    pub async fn connect(config: &MongoConfig) -> Result<Self> {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: config.host.clone(),
            port: Some(config.port),
        }];
        options.app_name = Some("mailarchive".to_string());
        if let Some(user) = &config.user {
            let mut credential = Credential::default();
            credential.username = Some(user.clone());
            credential.password = config.password.clone();
            credential.source = Some(config.auth_database.clone());
            options.credential = Some(credential);
        }
        let client = Client::with_options(options)
            .map_err(|err| ArchiveError::Connection(err.to_string()))?;
        let collection = client
            .database(&config.database)
            .collection::<Document>(COLLECTION);
        debug!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "mongodb client ready"
        );
        Ok(Self { client, collection })
    }
}

fn key_filter(account: &str, folder: &str, message_id: &str) -> Document {
    doc! {
        "account": account,
        "folder": folder,
        "message_id": message_id,
    }
}

fn record_document(record: &MessageRecord) -> Document {
    let headers: Vec<Bson> = record
        .headers
        .iter()
        .map(|(name, value)| Bson::Document(doc! { "header": name, "value": value }))
        .collect();
    doc! {
        "account": record.account.as_str(),
        "folder": record.folder.as_str(),
        "message_id": record.message_id.as_str(),
        "headers": headers,
        "body": record.body.as_str(),
    }
}

#[async_trait]
impl ArchiveStore for MongoArchiveStore {
    async fn exists(&self, account: &str, folder: &str, message_id: &str) -> Result<bool> {
        let count = self
            .collection
            .count_documents(key_filter(account, folder, message_id), None)
            .await?;
        Ok(count > 0)
    }

    async fn store(&self, record: &MessageRecord) -> Result<StoreOutcome> {
        if self
            .exists(&record.account, &record.folder, &record.message_id)
            .await?
        {
            return Ok(StoreOutcome::Duplicate);
        }
        self.collection
            .insert_one(record_document(record), None)
            .await
            .map_err(|err| {
                ArchiveError::Storage(format!(
                    "cannot insert document {}: {}",
                    record.message_id, err
                ))
            })?;
        Ok(StoreOutcome::Stored)
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::Bson;

    use super::{key_filter, record_document};
    use crate::{HeaderList, MessageRecord};

    fn sample() -> MessageRecord {
        let mut headers = HeaderList::new();
        headers.push("Message-ID", "<x@y>");
        headers.push("Subject", "hello");
        MessageRecord {
            account: "work".to_string(),
            folder: "INBOX".to_string(),
            message_id: "<x@y>".to_string(),
            headers,
            body: "body text".to_string(),
        }
    }

    #[test]
    fn document_keeps_headers_as_ordered_pairs() {
        let document = record_document(&sample());
        let headers = document.get_array("headers").unwrap();
        assert_eq!(headers.len(), 2);
        let Bson::Document(first) = &headers[0] else {
            panic!("header entry is not a document");
        };
        assert_eq!(first.get_str("header").unwrap(), "Message-ID");
        assert_eq!(first.get_str("value").unwrap(), "<x@y>");
        assert_eq!(document.get_str("body").unwrap(), "body text");
    }

    #[test]
    fn key_filter_matches_stored_document_fields() {
        let record = sample();
        let document = record_document(&record);
        let filter = key_filter(&record.account, &record.folder, &record.message_id);

        assert_eq!(filter.len(), 3);
        for (key, value) in filter.iter() {
            assert_eq!(document.get(key), Some(value), "field {key} differs");
        }
    }
}
