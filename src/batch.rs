//! Batches and batch items delivered to subscription listeners.
//!
//! A batch is the ordered run of `Data` frames bounded by one `EndOfBatch`.
//! Items keep their raw payloads; documents materialize lazily through
//! serde when a listener asks, so a batch is shareable across threads no
//! matter what the document type is.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, SubscriptionError};
use crate::protocol::KeyProfile;

/// A current/previous pair for revision subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision<T> {
    pub current: Option<T>,
    pub previous: Option<T>,
}

/// One document (or revision pair) inside a batch.
#[derive(Debug)]
pub struct SubscriptionItem<T> {
    raw: Value,
    id: Option<String>,
    change_vector: Option<String>,
    profile: KeyProfile,
    _doc: PhantomData<fn() -> T>,
}

impl<T> SubscriptionItem<T> {
    fn from_payload(payload: Value, profile: KeyProfile) -> Self {
        let metadata = &profile.metadata_root(&payload)["@metadata"];
        let id = metadata["@id"].as_str().map(str::to_string);
        let change_vector = metadata["@change-vector"].as_str().map(str::to_string);
        Self {
            raw: payload,
            id,
            change_vector,
            profile,
            _doc: PhantomData,
        }
    }

    /// Document id from the item metadata.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Change vector from the item metadata.
    pub fn change_vector(&self) -> Option<&str> {
        self.change_vector.as_deref()
    }

    /// The untouched wire payload.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

impl<T: DeserializeOwned> SubscriptionItem<T> {
    /// Materialize the document.
    ///
    /// Only valid for document subscriptions; a revisions item has no
    /// single document to produce.
    pub fn document(&self) -> Result<T> {
        match self.profile {
            KeyProfile::Documents => Ok(serde_json::from_value(self.raw.clone())?),
            KeyProfile::Revisions => Err(SubscriptionError::InvalidOperation(
                "this is a revisions subscription; use revision() instead of document()"
                    .to_string(),
            )),
        }
    }

    /// Materialize the revision pair.
    pub fn revision(&self) -> Result<Revision<T>> {
        match self.profile {
            KeyProfile::Revisions => {
                let side = |key: &str| -> Result<Option<T>> {
                    match self.raw.get(key) {
                        None | Some(Value::Null) => Ok(None),
                        Some(doc) => Ok(Some(serde_json::from_value(doc.clone())?)),
                    }
                };
                Ok(Revision {
                    current: side("Current")?,
                    previous: side("Previous")?,
                })
            }
            KeyProfile::Documents => Err(SubscriptionError::InvalidOperation(
                "this is a document subscription; use document() instead of revision()"
                    .to_string(),
            )),
        }
    }
}

/// One delivered batch, shared with every batch listener.
#[derive(Debug)]
pub struct SubscriptionBatch<T> {
    items: Vec<SubscriptionItem<T>>,
    last_received_change_vector: Option<String>,
    node_tag: Option<String>,
}

impl<T> SubscriptionBatch<T> {
    /// Build a batch from the pump's accumulated `Data` payloads.
    ///
    /// The acknowledgement change vector is taken from the metadata of the
    /// last item; a non-empty batch without one is a protocol violation.
    pub fn initialize(
        incoming: Vec<Value>,
        profile: KeyProfile,
        node_tag: Option<String>,
    ) -> Result<Self> {
        let items: Vec<SubscriptionItem<T>> = incoming
            .into_iter()
            .map(|payload| SubscriptionItem::from_payload(payload, profile))
            .collect();

        let last_received_change_vector = match items.last() {
            Some(last) => Some(
                last.change_vector()
                    .ok_or_else(|| {
                        SubscriptionError::ProtocolViolation(
                            "last batch item carries no change vector".to_string(),
                        )
                    })?
                    .to_string(),
            ),
            None => None,
        };

        Ok(Self {
            items,
            last_received_change_vector,
            node_tag,
        })
    }

    /// Items in server order.
    pub fn items(&self) -> &[SubscriptionItem<T>] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Change vector this batch will be acknowledged with.
    pub fn last_received_change_vector(&self) -> Option<&str> {
        self.last_received_change_vector.as_deref()
    }

    /// Tag of the node that pushed this batch.
    pub fn node_tag(&self) -> Option<&str> {
        self.node_tag.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Dog {
        name: String,
    }

    fn doc(id: &str, cv: &str, name: &str) -> Value {
        json!({
            "name": name,
            "@metadata": { "@id": id, "@change-vector": cv }
        })
    }

    #[test]
    fn test_initialize_extracts_last_change_vector() {
        let incoming = vec![doc("dogs/1", "A:1", "Arava"), doc("dogs/2", "A:2", "Oscar")];
        let batch: SubscriptionBatch<Dog> =
            SubscriptionBatch::initialize(incoming, KeyProfile::Documents, Some("A".into()))
                .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.last_received_change_vector(), Some("A:2"));
        assert_eq!(batch.node_tag(), Some("A"));
        assert_eq!(batch.items()[0].id(), Some("dogs/1"));
        assert_eq!(batch.items()[1].change_vector(), Some("A:2"));
    }

    #[test]
    fn test_document_materialization() {
        let incoming = vec![doc("dogs/1", "A:1", "Arava")];
        let batch: SubscriptionBatch<Dog> =
            SubscriptionBatch::initialize(incoming, KeyProfile::Documents, None).unwrap();

        let dog = batch.items()[0].document().unwrap();
        assert_eq!(dog, Dog { name: "Arava".into() });
    }

    #[test]
    fn test_document_on_revisions_profile_rejected() {
        let incoming = vec![json!({
            "Current": doc("dogs/1", "A:2", "Arava"),
            "Previous": null
        })];
        let batch: SubscriptionBatch<Dog> =
            SubscriptionBatch::initialize(incoming, KeyProfile::Revisions, None).unwrap();

        assert!(batch.items()[0].document().is_err());
    }

    #[test]
    fn test_revision_materialization() {
        let incoming = vec![json!({
            "Current": doc("dogs/1", "A:3", "Arava"),
            "Previous": doc("dogs/1", "A:2", "Arava Sr")
        })];
        let batch: SubscriptionBatch<Dog> =
            SubscriptionBatch::initialize(incoming, KeyProfile::Revisions, None).unwrap();

        // Revisions metadata comes from the current side.
        assert_eq!(batch.last_received_change_vector(), Some("A:3"));

        let revision = batch.items()[0].revision().unwrap();
        assert_eq!(revision.current.unwrap().name, "Arava");
        assert_eq!(revision.previous.unwrap().name, "Arava Sr");
    }

    #[test]
    fn test_revision_with_missing_previous() {
        let incoming = vec![json!({ "Current": doc("dogs/1", "A:1", "Arava") })];
        let batch: SubscriptionBatch<Dog> =
            SubscriptionBatch::initialize(incoming, KeyProfile::Revisions, None).unwrap();

        let revision = batch.items()[0].revision().unwrap();
        assert!(revision.current.is_some());
        assert!(revision.previous.is_none());
    }

    #[test]
    fn test_empty_batch_has_no_change_vector() {
        let batch: SubscriptionBatch<Dog> =
            SubscriptionBatch::initialize(Vec::new(), KeyProfile::Documents, None).unwrap();
        assert!(batch.is_empty());
        assert!(batch.last_received_change_vector().is_none());
    }

    #[test]
    fn test_missing_change_vector_is_protocol_violation() {
        let incoming = vec![json!({ "name": "Arava", "@metadata": { "@id": "dogs/1" } })];
        let result: Result<SubscriptionBatch<Dog>> =
            SubscriptionBatch::initialize(incoming, KeyProfile::Documents, None);
        assert!(matches!(
            result,
            Err(SubscriptionError::ProtocolViolation(_))
        ));
    }
}
