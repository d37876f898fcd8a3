use std::ops::Deref;

use data_encoding::BASE64URL_NOPAD;
use ed25519_compact as ed25519;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_bytes::ByteArray;

/// Raw bytes in binary formats, base64 in human readable ones.
pub(crate) fn encode<S, T, const N: usize>(d: &T, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Deref<Target = [u8; N]>,
{
    if s.is_human_readable() {
        s.serialize_str(&BASE64URL_NOPAD.encode(&**d))
    } else {
        ByteArray::new(**d).serialize(s)
    }
}

fn decode<'de, D, const N: usize>(d: D) -> Result<[u8; N], D::Error>
where
    D: Deserializer<'de>,
{
    if d.is_human_readable() {
        let s = String::deserialize(d)?;
        let v = BASE64URL_NOPAD
            .decode(s.as_bytes())
            .map_err(de::Error::custom)?;
        <[u8; N]>::try_from(v).map_err(|v| de::Error::invalid_length(v.len(), &"fixed size key"))
    } else {
        Ok(ByteArray::<N>::deserialize(d)?.into_array())
    }
}

pub(crate) fn decode_pk<'de, D>(d: D) -> Result<ed25519::PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let a: [u8; 32] = decode(d)?;
    ed25519::PublicKey::from_slice(&a).map_err(|_| de::Error::custom("invalid public key"))
}

pub(crate) fn decode_sk<'de, D>(d: D) -> Result<ed25519::SecretKey, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(ed25519::SecretKey::new(decode(d)?))
}

pub(crate) fn decode_sig<'de, D>(d: D) -> Result<ed25519::Signature, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(ed25519::Signature::new(decode(d)?))
}
