//! Snapshot hooks and the codec registry used by external serializers.

use crate::error::SnapshotError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Types that can be captured and rehydrated by a serializer.
///
/// The snapshot only has to be serde-compatible; the on-disk format belongs
/// to whoever persists it.
pub trait Snapshot: Sized {
    /// Serializable form of the value.
    type Data: Serialize + DeserializeOwned;

    /// Captures the value.
    fn create_snapshot(&self) -> Self::Data;

    /// Rebuilds a value from a snapshot.
    fn load_snapshot(data: Self::Data) -> Result<Self, SnapshotError>;
}

/// A snapshot tagged with the codec that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedSnapshot {
    /// Registry tag.
    pub tag: String,
    /// Encoded snapshot.
    pub data: Value,
}

type EncodeFn = Box<dyn Fn(&dyn Any) -> Result<Value, SnapshotError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(Value) -> Result<Box<dyn Any + Send>, SnapshotError> + Send + Sync>;

struct Codec {
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Maps type tags to encode/decode functions.
///
/// Populated explicitly at startup, one [`register`](Self::register) call per
/// type.
#[derive(Default)]
pub struct SnapshotRegistry {
    codecs: HashMap<String, Codec>,
}

impl fmt::Debug for SnapshotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotRegistry")
            .field("tags", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SnapshotRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `tag`, replacing any previous codec for the tag.
    pub fn register<T>(&mut self, tag: impl Into<String>) -> &mut Self
    where
        T: Snapshot + Send + 'static,
    {
        let tag = tag.into();
        let encode_tag = tag.clone();
        let codec = Codec {
            type_id: TypeId::of::<T>(),
            encode: Box::new(move |value| {
                let value = value
                    .downcast_ref::<T>()
                    .ok_or_else(|| SnapshotError::TypeMismatch(encode_tag.clone()))?;
                Ok(serde_json::to_value(value.create_snapshot())?)
            }),
            decode: Box::new(|data| {
                let data: T::Data = serde_json::from_value(data)?;
                Ok(Box::new(T::load_snapshot(data)?) as Box<dyn Any + Send>)
            }),
        };
        self.codecs.insert(tag, codec);
        self
    }

    /// Removes the codec for `tag`.
    pub fn unregister(&mut self, tag: &str) -> bool {
        self.codecs.remove(tag).is_some()
    }

    /// Returns `true` if a codec is registered for `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.codecs.contains_key(tag)
    }

    /// Returns the tag registered for `T`, if any.
    pub fn tag_of<T: 'static>(&self) -> Option<&str> {
        let type_id = TypeId::of::<T>();
        self.codecs
            .iter()
            .find(|(_, codec)| codec.type_id == type_id)
            .map(|(tag, _)| tag.as_str())
    }

    /// Encodes `value` with the codec registered for its type.
    pub fn encode<T: 'static>(&self, value: &T) -> Result<TaggedSnapshot, SnapshotError> {
        let tag = self
            .tag_of::<T>()
            .ok_or_else(|| SnapshotError::UnknownTag(std::any::type_name::<T>().to_string()))?;
        let codec = self
            .codecs
            .get(tag)
            .ok_or_else(|| SnapshotError::UnknownTag(tag.to_string()))?;
        Ok(TaggedSnapshot {
            tag: tag.to_string(),
            data: (codec.encode)(value)?,
        })
    }

    /// Decodes a tagged snapshot into `T`.
    pub fn decode<T: 'static>(&self, snapshot: TaggedSnapshot) -> Result<T, SnapshotError> {
        let codec = self
            .codecs
            .get(&snapshot.tag)
            .ok_or_else(|| SnapshotError::UnknownTag(snapshot.tag.clone()))?;
        if codec.type_id != TypeId::of::<T>() {
            return Err(SnapshotError::TypeMismatch(snapshot.tag));
        }
        let value = (codec.decode)(snapshot.data)?;
        value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| SnapshotError::TypeMismatch(snapshot.tag))
    }
}
