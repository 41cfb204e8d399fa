//! etcd-backed change source.

use anyhow::{Context, Result};
use async_trait::async_trait;
use nsproxy_etcd::{Client, EtcdError, Response};
use tracing::{debug, info};

use crate::feed::{Change, ChangeSource, Watched};
use crate::registry::{Snapshot, Watermark};

/// Announcements stored under one etcd directory.
pub struct EtcdSource {
    client: Client,
    path: String,
}

impl EtcdSource {
    /// Create a source reading the announcement directory at `path`.
    pub fn new(client: Client, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }
}

#[async_trait]
impl ChangeSource for EtcdSource {
    async fn snapshot(&self) -> Result<Snapshot> {
        match self.client.get(&self.path, true).await {
            Ok(response) => Ok(snapshot_from_response(&response)),
            Err(EtcdError::Api(api)) if api.is_key_not_found() => {
                info!(
                    path = %self.path,
                    index = api.index,
                    "Announcement directory does not exist yet"
                );
                Ok(Snapshot {
                    entries: Vec::new(),
                    watermark: Watermark(api.index + 1),
                })
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path)),
        }
    }

    async fn watch(&self, from: Watermark) -> Result<Watched> {
        match self.client.watch(&self.path, from.0).await {
            Ok(Some(response)) => Ok(translate(&response)),
            Ok(None) => Ok(Watched::Idle),
            Err(e) if e.is_index_cleared() => Ok(Watched::Outdated),
            Err(e) => Err(e).with_context(|| format!("failed to watch {}", self.path)),
        }
    }
}

/// Build a snapshot from a recursive read.
///
/// Resumes after the store index the read was served at, falling back to the
/// newest index found in the tree when the header is missing.
pub fn snapshot_from_response(response: &Response) -> Snapshot {
    let entries = response
        .node
        .leaves()
        .into_iter()
        .map(|node| (node.key.clone(), node.value.clone().unwrap_or_default()))
        .collect();

    let index = response
        .etcd_index
        .unwrap_or_else(|| response.node.max_modified_index());

    Snapshot {
        entries,
        watermark: Watermark(index + 1),
    }
}

/// Map a watch event onto a registry change.
pub fn translate(response: &Response) -> Watched {
    let node = &response.node;
    let next = Watermark(node.modified_index + 1);
    let action = response.action;

    let change = if node.dir {
        if action.is_removal() {
            Change::DeleteTree {
                prefix: node.key.clone(),
            }
        } else {
            debug!(key = %node.key, ?action, "Ignoring directory event");
            return Watched::Skip { next };
        }
    } else if action.is_put() {
        Change::Put {
            key: node.key.clone(),
            payload: node.value.clone(),
        }
    } else if action.is_removal() {
        Change::Delete {
            key: node.key.clone(),
        }
    } else {
        debug!(key = %node.key, ?action, "Ignoring event");
        return Watched::Skip { next };
    };

    Watched::Change { change, next }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: &str) -> Response {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_put_actions_translate_to_put() {
        for action in ["set", "create", "update", "compareAndSwap"] {
            let response = event(&format!(
                r#"{{"action":"{action}","node":{{"key":"/svc/a","value":"v","modifiedIndex":10}}}}"#
            ));
            assert_eq!(
                translate(&response),
                Watched::Change {
                    change: Change::Put {
                        key: "/svc/a".into(),
                        payload: Some("v".into()),
                    },
                    next: Watermark(11),
                },
                "action {action}"
            );
        }
    }

    #[test]
    fn test_removal_actions_translate_to_delete() {
        for action in ["delete", "expire", "compareAndDelete"] {
            let response = event(&format!(
                r#"{{"action":"{action}","node":{{"key":"/svc/a","modifiedIndex":12}}}}"#
            ));
            assert_eq!(
                translate(&response),
                Watched::Change {
                    change: Change::Delete {
                        key: "/svc/a".into()
                    },
                    next: Watermark(13),
                },
                "action {action}"
            );
        }
    }

    #[test]
    fn test_directory_events() {
        let expired = event(r#"{"action":"expire","node":{"key":"/svc/web","dir":true,"modifiedIndex":20}}"#);
        assert_eq!(
            translate(&expired),
            Watched::Change {
                change: Change::DeleteTree {
                    prefix: "/svc/web".into()
                },
                next: Watermark(21),
            }
        );

        let created = event(r#"{"action":"create","node":{"key":"/svc/web","dir":true,"modifiedIndex":22}}"#);
        assert_eq!(translate(&created), Watched::Skip { next: Watermark(23) });
    }

    #[test]
    fn test_unknown_action_is_skipped() {
        let response = event(r#"{"action":"get","node":{"key":"/svc/a","value":"v","modifiedIndex":30}}"#);
        assert_eq!(translate(&response), Watched::Skip { next: Watermark(31) });
    }

    #[test]
    fn test_snapshot_uses_store_index() {
        let mut response = event(
            r#"{"action":"get","node":{"key":"/svc","dir":true,"modifiedIndex":2,"nodes":[
                {"key":"/svc/a","value":"x","modifiedIndex":5},
                {"key":"/svc/b","modifiedIndex":6}
            ]}}"#,
        );

        let snapshot = snapshot_from_response(&response);
        assert_eq!(
            snapshot.entries,
            vec![
                ("/svc/a".to_string(), "x".to_string()),
                ("/svc/b".to_string(), String::new()),
            ]
        );
        assert_eq!(snapshot.watermark, Watermark(7));

        response.etcd_index = Some(40);
        assert_eq!(snapshot_from_response(&response).watermark, Watermark(41));
    }
}
