use crate::crypto::CryptoEngine;
use crate::error::{Result, StrataError};

/// Domain-separation marker for object identity binding in AEAD AAD.
const OBJECT_CONTEXT_AAD_PREFIX: &[u8] = b"strata:object-context:v1\0";

/// Object type tags for the repository envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    ContentData = 1,
    PackHeader = 2,
    IndexBlob = 3,
}

impl ObjectType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::ContentData),
            2 => Ok(Self::PackHeader),
            3 => Ok(Self::IndexBlob),
            _ => Err(StrataError::UnknownObjectType(v)),
        }
    }
}

fn contextual_aad(tag: u8, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + OBJECT_CONTEXT_AAD_PREFIX.len() + context.len());
    aad.push(tag);
    aad.extend_from_slice(OBJECT_CONTEXT_AAD_PREFIX);
    aad.extend_from_slice(context);
    aad
}

/// Encrypt a payload into a typed object bound to `context`.
///
/// Wire format: `[1-byte type tag][crypto.encrypt(plaintext)]`.
pub fn pack_object(
    obj_type: ObjectType,
    context: &[u8],
    plaintext: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let tag = obj_type as u8;
    let encrypted = crypto.encrypt(plaintext, &contextual_aad(tag, context))?;
    let mut out = Vec::with_capacity(1 + encrypted.len());
    out.push(tag);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Decrypt an object, ensuring its type tag matches `expected_type`.
pub fn unpack_object(
    data: &[u8],
    expected_type: ObjectType,
    context: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let (&tag, encrypted) = data
        .split_first()
        .ok_or_else(|| StrataError::InvalidFormat("empty object".into()))?;
    let obj_type = ObjectType::from_u8(tag)?;
    // Authenticate before trusting the type tag.
    let plaintext = crypto.decrypt(encrypted, &contextual_aad(tag, context))?;
    if obj_type != expected_type {
        return Err(StrataError::InvalidFormat(format!(
            "unexpected object type: expected {expected_type:?}, got {obj_type:?}"
        )));
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Aes256GcmEngine, PlaintextEngine};

    #[test]
    fn context_is_authenticated() {
        let engine = Aes256GcmEngine::new(&[1; 32], &[2; 32]);
        let obj = pack_object(ObjectType::IndexBlob, b"a", b"payload", &engine).unwrap();
        assert_eq!(
            unpack_object(&obj, ObjectType::IndexBlob, b"a", &engine).unwrap(),
            b"payload"
        );
        assert!(unpack_object(&obj, ObjectType::IndexBlob, b"b", &engine).is_err());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let engine = PlaintextEngine::new(&[0; 32]);
        let obj = pack_object(ObjectType::PackHeader, b"", b"x", &engine).unwrap();
        assert!(unpack_object(&obj, ObjectType::IndexBlob, b"", &engine).is_err());
        assert!(matches!(
            unpack_object(&[9, 1], ObjectType::IndexBlob, b"", &engine),
            Err(StrataError::UnknownObjectType(9))
        ));
    }
}
