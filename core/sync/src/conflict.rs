//! Conflict detection and resolution.

use serde_json::Value;

use offsync_common::{ConcurrencyToken, Error, Result};
use offsync_storage::{ConflictEntry, ResolutionStrategy};

/// Key under which a conflict is stored.
///
/// `source` identifies the record that raised it (`q<id>` for queue items,
/// `t<id>` for transactions) so repeated conflicts on one entity keep their
/// own audit trail.
pub fn conflict_key(entity_type: &str, entity_id: &str, source: &str) -> String {
    format!("conflict:{}:{}:{}", entity_type, entity_id, source)
}

/// Payload chosen for a conflict and whether it must be written remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub payload: Value,
    /// `false` when the server already holds `payload`.
    pub push: bool,
}

/// Conflict detector and resolver.
pub struct ConflictResolver {
    token: ConcurrencyToken,
}

impl ConflictResolver {
    /// Create a resolver comparing records by `token`.
    pub fn new(token: ConcurrencyToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &ConcurrencyToken {
        &self.token
    }

    /// Whether `server` changed since the client last saw `last_known`.
    ///
    /// Without a recorded baseline, or when the server record carries no
    /// token, there is nothing to compare and the write proceeds.
    pub fn detect(&self, server: &Value, last_known: Option<&Value>) -> bool {
        match (self.token.read(server), last_known) {
            (Some(server_token), Some(known)) => self.token.server_is_newer(&server_token, known),
            _ => false,
        }
    }

    /// Non-destructive merge: server values win on overlapping keys and
    /// client-only keys are added.
    pub fn merge(client: &Value, server: &Value) -> Value {
        match (client, server) {
            (Value::Object(client), Value::Object(server)) => {
                let mut merged = server.clone();
                for (key, value) in client {
                    merged.entry(key.clone()).or_insert_with(|| value.clone());
                }
                Value::Object(merged)
            }
            _ => server.clone(),
        }
    }

    /// Decide the payload for `entry` under `strategy`.
    ///
    /// # Errors
    /// - `InvalidOperation` for `manual` without a supplied resolution
    pub fn plan(
        &self,
        entry: &ConflictEntry,
        strategy: ResolutionStrategy,
        supplied: Option<Value>,
    ) -> Result<Resolution> {
        let (payload, push) = match strategy {
            ResolutionStrategy::ClientWins => (entry.client_data.clone(), true),
            ResolutionStrategy::ServerWins => (entry.server_data.clone(), false),
            ResolutionStrategy::Merge => (
                supplied.unwrap_or_else(|| Self::merge(&entry.client_data, &entry.server_data)),
                true,
            ),
            ResolutionStrategy::Manual => match supplied {
                Some(payload) => (payload, true),
                None => {
                    return Err(Error::InvalidOperation(
                        "manual resolution requires a resolved payload".to_string(),
                    ))
                }
            },
        };
        Ok(Resolution {
            strategy,
            payload,
            push,
        })
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConcurrencyToken::default())
    }
}
