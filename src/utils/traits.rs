use serde::{de::DeserializeOwned, Serialize};

use crate::fs::error::{FsError, Result};

/// Trait for digesting an object which stores digest in the object itself
pub trait DigestInSelf {
    fn digest(&mut self) -> Result<()>;
    fn verify_digest(&mut self) -> Result<bool>;
}

/// Trait for serializing and deserializing an object which stores digest in the object itself
/// # Note
/// This trait is implemented for all types implementing
/// [Serialize] and [DeserializeOwned] and [DigestInSelf]
pub trait SerializeAndDigest: Serialize + DeserializeOwned + DigestInSelf {
    /// serialize into a [Vec](std::vec::Vec)
    fn serialize_to_vec(&mut self) -> Result<Vec<u8>> {
        self.digest()?;
        let config = bincode::config::legacy();
        bincode::serde::encode_to_vec(&*self, config).map_err(|e| FsError::Codec(e.to_string()))
    }

    /// deserialize from a slice
    /// # Returns
    /// A tuple containing the deserialized object and the number of bytes read
    fn deserialize_from_slice(buf: &[u8]) -> Result<(Self, usize)> {
        let config = bincode::config::legacy();
        let (mut object, bytes_read): (Self, usize) =
            bincode::serde::decode_from_slice(buf, config)
                .map_err(|e| FsError::Codec(e.to_string()))?;
        if !object.verify_digest()? {
            Err(FsError::Codec(
                "deserialized object digest verification failed".into(),
            ))
        } else {
            Ok((object, bytes_read))
        }
    }
}
