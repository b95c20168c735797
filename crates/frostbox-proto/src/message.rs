//! Message tags and payload (en|de)coding (`§4.4`).

use bytes::{Bytes, BytesMut};
use frostbox_common::CoreError;

use crate::primitive::*;

/// Wire tags. The exact integers are part of the protocol: both ends must
/// agree on them, so they are never renumbered even when a variant is
/// removed (tag 3, `FeedItem`, is never framed on its own — see the feed
/// batch codec instead).
pub mod tag {
    pub const PING: i32 = 1;
    pub const BEGIN_FEED: i32 = 2;
    pub const CREATE_COLLECTION: i32 = 5;
    pub const STATUS_RESPONSE: i32 = 6;
    pub const QUERY_BY_PRIMARY_KEY: i32 = 7;
    pub const QUERY_RESPONSE: i32 = 8;
    pub const DROP_COLLECTION: i32 = 9;
    pub const GET_COLLECTIONS_DESCRIPTION: i32 = 10;
    pub const COLLECTIONS_DESCRIPTION: i32 = 11;
}

/// One entry of a `CollectionsDescription` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDescriptor {
    pub name: String,
    pub count: i64,
    pub size_in_bytes: i64,
    pub last_version: Option<String>,
    pub key_names: Vec<String>,
    pub segment_file_size: i64,
    pub max_objects_per_segment: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    BeginFeed {
        collection: String,
        version: String,
    },
    CreateCollection {
        collection: String,
        primary_key_name: String,
        other_index_names: Vec<String>,
    },
    StatusResponse {
        success: bool,
        error: Option<String>,
    },
    QueryByPrimaryKey {
        collection: String,
        primary_key_values: Vec<i64>,
    },
    QueryResponse {
        single_answer: bool,
        objects_data: Vec<Vec<u8>>,
        collection: Option<String>,
    },
    DropCollection {
        collection: String,
    },
    GetCollectionsDescription,
    CollectionsDescription {
        collections: Vec<CollectionDescriptor>,
    },
}

impl Message {
    pub fn status(success: bool, error: Option<String>) -> Self {
        Message::StatusResponse { success, error }
    }

    pub fn ok_status() -> Self {
        Message::status(true, None)
    }

    pub fn error_status(reason: impl Into<String>) -> Self {
        Message::status(false, Some(reason.into()))
    }

    pub fn tag(&self) -> i32 {
        match self {
            Message::Ping => tag::PING,
            Message::BeginFeed { .. } => tag::BEGIN_FEED,
            Message::CreateCollection { .. } => tag::CREATE_COLLECTION,
            Message::StatusResponse { .. } => tag::STATUS_RESPONSE,
            Message::QueryByPrimaryKey { .. } => tag::QUERY_BY_PRIMARY_KEY,
            Message::QueryResponse { .. } => tag::QUERY_RESPONSE,
            Message::DropCollection { .. } => tag::DROP_COLLECTION,
            Message::GetCollectionsDescription => tag::GET_COLLECTIONS_DESCRIPTION,
            Message::CollectionsDescription { .. } => tag::COLLECTIONS_DESCRIPTION,
        }
    }

    pub fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::Ping | Message::GetCollectionsDescription => {}
            Message::BeginFeed { collection, version } => {
                put_string(&mut buf, collection);
                put_string(&mut buf, version);
            }
            Message::CreateCollection {
                collection,
                primary_key_name,
                other_index_names,
            } => {
                put_string(&mut buf, collection);
                put_string(&mut buf, primary_key_name);
                put_string_vec(&mut buf, other_index_names);
            }
            Message::StatusResponse { success, error } => {
                put_bool(&mut buf, *success);
                put_option_string(&mut buf, error);
            }
            Message::QueryByPrimaryKey {
                collection,
                primary_key_values,
            } => {
                put_string(&mut buf, collection);
                put_i64_vec(&mut buf, primary_key_values);
            }
            Message::QueryResponse {
                single_answer,
                objects_data,
                collection,
            } => {
                put_bool(&mut buf, *single_answer);
                put_bytes_vec(&mut buf, objects_data);
                put_option_string(&mut buf, collection);
            }
            Message::DropCollection { collection } => {
                put_string(&mut buf, collection);
            }
            Message::CollectionsDescription { collections } => {
                put_i32(&mut buf, collections.len() as i32);
                for d in collections {
                    put_string(&mut buf, &d.name);
                    put_i64(&mut buf, d.count);
                    put_i64(&mut buf, d.size_in_bytes);
                    put_option_string(&mut buf, &d.last_version);
                    put_string_vec(&mut buf, &d.key_names);
                    put_i64(&mut buf, d.segment_file_size);
                    put_i64(&mut buf, d.max_objects_per_segment);
                }
            }
        }
        buf
    }

    pub fn decode(frame_tag: i32, payload: &[u8]) -> Result<Message, CoreError> {
        let mut buf = Bytes::copy_from_slice(payload);
        let message = match frame_tag {
            tag::PING => Message::Ping,
            tag::GET_COLLECTIONS_DESCRIPTION => Message::GetCollectionsDescription,
            tag::BEGIN_FEED => Message::BeginFeed {
                collection: get_string(&mut buf)?,
                version: get_string(&mut buf)?,
            },
            tag::CREATE_COLLECTION => Message::CreateCollection {
                collection: get_string(&mut buf)?,
                primary_key_name: get_string(&mut buf)?,
                other_index_names: get_string_vec(&mut buf)?,
            },
            tag::STATUS_RESPONSE => Message::StatusResponse {
                success: get_bool(&mut buf)?,
                error: get_option_string(&mut buf)?,
            },
            tag::QUERY_BY_PRIMARY_KEY => Message::QueryByPrimaryKey {
                collection: get_string(&mut buf)?,
                primary_key_values: get_i64_vec(&mut buf)?,
            },
            tag::QUERY_RESPONSE => Message::QueryResponse {
                single_answer: get_bool(&mut buf)?,
                objects_data: get_bytes_vec(&mut buf)?,
                collection: get_option_string(&mut buf)?,
            },
            tag::DROP_COLLECTION => Message::DropCollection {
                collection: get_string(&mut buf)?,
            },
            tag::COLLECTIONS_DESCRIPTION => {
                let count = get_i32(&mut buf)?;
                if count < 0 {
                    return Err(malformed("negative collection-description count"));
                }
                let mut collections = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    collections.push(CollectionDescriptor {
                        name: get_string(&mut buf)?,
                        count: get_i64(&mut buf)?,
                        size_in_bytes: get_i64(&mut buf)?,
                        last_version: get_option_string(&mut buf)?,
                        key_names: get_string_vec(&mut buf)?,
                        segment_file_size: get_i64(&mut buf)?,
                        max_objects_per_segment: get_i64(&mut buf)?,
                    });
                }
                Message::CollectionsDescription { collections }
            }
            other => {
                return Err(CoreError::MalformedFrame {
                    reason: format!("unknown message tag {other}"),
                })
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trips(message: Message) {
        let payload = message.encode_payload();
        let decoded = Message::decode(message.tag(), &payload).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn ping_round_trips() {
        round_trips(Message::Ping);
    }

    #[test]
    fn begin_feed_round_trips() {
        round_trips(Message::BeginFeed {
            collection: "persons".into(),
            version: "001".into(),
        });
    }

    #[test]
    fn create_collection_round_trips() {
        round_trips(Message::CreateCollection {
            collection: "persons".into(),
            primary_key_name: "id".into(),
            other_index_names: vec!["name".into(), "age".into()],
        });
    }

    #[test]
    fn status_response_round_trips_both_variants() {
        round_trips(Message::ok_status());
        round_trips(Message::error_status("version not newer"));
    }

    #[test]
    fn query_round_trips() {
        round_trips(Message::QueryByPrimaryKey {
            collection: "persons".into(),
            primary_key_values: vec![1, 2, 1_000_003],
        });
        round_trips(Message::QueryResponse {
            single_answer: true,
            objects_data: vec![vec![0u8; 1000], vec![0u8; 100]],
            collection: Some("persons".into()),
        });
    }

    #[test]
    fn collections_description_round_trips() {
        round_trips(Message::CollectionsDescription {
            collections: vec![CollectionDescriptor {
                name: "persons".into(),
                count: 2,
                size_in_bytes: 1100,
                last_version: Some("001".into()),
                key_names: vec!["id".into(), "client_id".into()],
                segment_file_size: 1_000_000_000,
                max_objects_per_segment: 1_000_000,
            }],
        });
    }

    #[test]
    fn unknown_tag_is_malformed() {
        assert!(matches!(
            Message::decode(42, &[]),
            Err(CoreError::MalformedFrame { .. })
        ));
    }
}
