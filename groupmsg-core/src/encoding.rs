//! Binary encoding interface for everything that is persisted.
//!
//! Numbers are written big-endian with a fixed width, so the encoding of a
//! key sorts the same way as the key itself. Database prefix scans rely on
//! this to return records in key order.
//!
//! See [`Encodable`] and [`Decodable`] for two main traits.

use std::fmt::Formatter;
use std::io::{self, Error, Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Data which can be encoded in a stable, self-delimiting format
pub trait Encodable {
    /// Encode an object with a well-defined format.
    /// Returns the number of bytes written on success.
    ///
    /// The only errors returned are errors propagated from the writer.
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, std::io::Error>;

    /// [`Self::consensus_encode`] to newly allocated `Vec<u8>`
    fn consensus_encode_to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![];
        self.consensus_encode(&mut bytes)
            .expect("encoding to bytes can't fail for io reasons");
        bytes
    }

    /// Encode without storing the encoding, return the size
    fn consensus_encode_to_len(&self) -> usize {
        self.consensus_encode(&mut io::sink())
            .expect("encoding to bytes can't fail for io reasons")
    }
}

impl<T> Encodable for &T
where
    T: Encodable,
{
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, std::io::Error> {
        (**self).consensus_encode(writer)
    }
}

/// Maximum size, in bytes, of data we are allowed to ever decode
/// for a single value.
pub const MAX_DECODE_SIZE: usize = 16_000_000;

/// Data which can be decoded from the format written by [`Encodable`]
pub trait Decodable: Sized {
    /// Decode `Self` from a size-limited reader.
    ///
    /// Types that allocate based on a decoded, untrusted length implement
    /// this method; everything else only implements
    /// [`Self::consensus_decode`].
    #[inline]
    fn consensus_decode_from_finite_reader<R: std::io::Read>(
        r: &mut R,
    ) -> Result<Self, DecodeError> {
        Self::consensus_decode(r)
    }

    /// Decode an object with a well-defined format.
    ///
    /// Default implementation wraps the reader in [`std::io::Take`] limited
    /// to [`MAX_DECODE_SIZE`] and forwards to
    /// [`Self::consensus_decode_from_finite_reader`].
    #[inline]
    fn consensus_decode<R: std::io::Read>(r: &mut R) -> Result<Self, DecodeError> {
        Self::consensus_decode_from_finite_reader(&mut r.take(MAX_DECODE_SIZE as u64))
    }

    /// Decode from a byte slice, failing if any bytes are left over
    fn consensus_decode_whole(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = std::io::Cursor::new(bytes);
        let value = Self::consensus_decode(&mut reader)?;
        if reader.position() != bytes.len() as u64 {
            return Err(DecodeError::from_str("Trailing bytes after decoding"));
        }
        Ok(value)
    }
}

#[derive(Debug, Error)]
pub struct DecodeError(pub(crate) anyhow::Error);

impl DecodeError {
    pub fn new_custom(e: anyhow::Error) -> Self {
        Self(e)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &'static str) -> Self {
        Self(anyhow::Error::msg(s))
    }

    pub fn from_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self(anyhow::Error::from(e))
    }
}

impl From<anyhow::Error> for DecodeError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

macro_rules! impl_encode_decode_num_as_plain {
    ($num_type:ty) => {
        impl Encodable for $num_type {
            fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, Error> {
                let bytes = self.to_be_bytes();
                writer.write_all(&bytes[..])?;
                Ok(bytes.len())
            }
        }

        impl Decodable for $num_type {
            fn consensus_decode<D: std::io::Read>(d: &mut D) -> Result<Self, DecodeError> {
                let mut bytes = [0u8; (<$num_type>::BITS / 8) as usize];
                d.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
                Ok(<$num_type>::from_be_bytes(bytes))
            }
        }
    };
}

impl_encode_decode_num_as_plain!(u64);
impl_encode_decode_num_as_plain!(u32);
impl_encode_decode_num_as_plain!(u16);
impl_encode_decode_num_as_plain!(u8);

macro_rules! impl_encode_decode_tuple {
    ($($x:ident),*) => (
        #[allow(non_snake_case)]
        impl <$($x: Encodable),*> Encodable for ($($x),*) {
            fn consensus_encode<W: std::io::Write>(&self, s: &mut W) -> Result<usize, std::io::Error> {
                let &($(ref $x),*) = self;
                let mut len = 0;
                $(len += $x.consensus_encode(s)?;)*
                Ok(len)
            }
        }

        #[allow(non_snake_case)]
        impl<$($x: Decodable),*> Decodable for ($($x),*) {
            fn consensus_decode_from_finite_reader<D: std::io::Read>(d: &mut D) -> Result<Self, DecodeError> {
                Ok(($({let $x = Decodable::consensus_decode_from_finite_reader(d)?; $x }),*))
            }
        }
    );
}

impl_encode_decode_tuple!(T1, T2);
impl_encode_decode_tuple!(T1, T2, T3);

impl Encodable for () {
    fn consensus_encode<W: std::io::Write>(
        &self,
        _writer: &mut W,
    ) -> Result<usize, std::io::Error> {
        Ok(0)
    }
}

impl Decodable for () {
    fn consensus_decode<D: std::io::Read>(_d: &mut D) -> Result<Self, DecodeError> {
        Ok(())
    }
}

impl Encodable for bool {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        let bool_as_u8 = u8::from(*self);
        writer.write_all(&[bool_as_u8])?;
        Ok(1)
    }
}

impl Decodable for bool {
    fn consensus_decode<D: Read>(d: &mut D) -> Result<Self, DecodeError> {
        let mut bool_as_u8 = [0u8];
        d.read_exact(&mut bool_as_u8)
            .map_err(DecodeError::from_err)?;
        match bool_as_u8[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::from_str("Out of range, expected 0 or 1")),
        }
    }
}

impl<T> Encodable for Option<T>
where
    T: Encodable,
{
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, std::io::Error> {
        let mut len = 0;
        if let Some(inner) = self {
            len += 1u8.consensus_encode(writer)?;
            len += inner.consensus_encode(writer)?;
        } else {
            len += 0u8.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl<T> Decodable for Option<T>
where
    T: Decodable,
{
    fn consensus_decode_from_finite_reader<D: std::io::Read>(
        d: &mut D,
    ) -> Result<Self, DecodeError> {
        let flag = u8::consensus_decode_from_finite_reader(d)?;
        match flag {
            0 => Ok(None),
            1 => Ok(Some(T::consensus_decode_from_finite_reader(d)?)),
            _ => Err(DecodeError::from_str(
                "Invalid flag for option enum, expected 0 or 1",
            )),
        }
    }
}

impl<T> Encodable for [T]
where
    T: Encodable,
{
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        let mut len = 0;
        len += (self.len() as u64).consensus_encode(writer)?;
        for item in self {
            len += item.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl<T> Encodable for Vec<T>
where
    T: Encodable,
{
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        self.as_slice().consensus_encode(writer)
    }
}

impl<T> Decodable for Vec<T>
where
    T: Decodable,
{
    fn consensus_decode_from_finite_reader<D: std::io::Read>(
        d: &mut D,
    ) -> Result<Self, DecodeError> {
        let len = u64::consensus_decode_from_finite_reader(d)?;

        // Untrusted `len` must not be used to pre-allocate, the reader running
        // out of data is what bounds the loop below.
        let cap_len = std::cmp::min(8_000 / std::mem::size_of::<T>().max(1) as u64, len);
        let mut v = Vec::with_capacity(cap_len as usize);
        while (v.len() as u64) < len {
            v.push(T::consensus_decode_from_finite_reader(d)?);
        }

        Ok(v)
    }
}

impl<const N: usize> Encodable for [u8; N] {
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, Error> {
        writer.write_all(self)?;
        Ok(N)
    }
}

impl<const N: usize> Decodable for [u8; N] {
    fn consensus_decode<D: std::io::Read>(d: &mut D) -> Result<Self, DecodeError> {
        let mut bytes = [0u8; N];
        d.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
        Ok(bytes)
    }
}

impl Encodable for String {
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, Error> {
        self.as_bytes().consensus_encode(writer)
    }
}

impl Decodable for String {
    fn consensus_decode_from_finite_reader<D: std::io::Read>(
        d: &mut D,
    ) -> Result<Self, DecodeError> {
        Self::from_utf8(Decodable::consensus_decode_from_finite_reader(d)?)
            .map_err(DecodeError::from_err)
    }
}

impl Encodable for Duration {
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, std::io::Error> {
        let mut count = 0;
        count += self.as_secs().consensus_encode(writer)?;
        count += self.subsec_nanos().consensus_encode(writer)?;

        Ok(count)
    }
}

impl Decodable for Duration {
    fn consensus_decode<D: std::io::Read>(d: &mut D) -> Result<Self, DecodeError> {
        let secs = Decodable::consensus_decode(d)?;
        let nsecs = Decodable::consensus_decode(d)?;
        Ok(Self::new(secs, nsecs))
    }
}

impl Encodable for SystemTime {
    fn consensus_encode<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, std::io::Error> {
        let duration = self.duration_since(UNIX_EPOCH).map_err(io::Error::other)?;
        duration.consensus_encode(writer)
    }
}

impl Decodable for SystemTime {
    fn consensus_decode<D: std::io::Read>(d: &mut D) -> Result<Self, DecodeError> {
        let duration = Duration::consensus_decode(d)?;
        Ok(UNIX_EPOCH + duration)
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use super::*;

    fn test_roundtrip<T>(value: &T)
    where
        T: Encodable + Decodable + Eq + Debug,
    {
        let bytes = value.consensus_encode_to_vec();
        assert_eq!(bytes.len(), value.consensus_encode_to_len());
        let decoded = T::consensus_decode_whole(&bytes).expect("decoding failed");
        assert_eq!(value, &decoded);
    }

    #[test_log::test]
    fn test_big_endian_keys_sort_like_numbers() {
        let mut encoded = [3u64, 256, 1, u64::MAX, 255]
            .iter()
            .map(|n| (n.consensus_encode_to_vec(), *n))
            .collect::<Vec<_>>();
        encoded.sort();
        let sorted = encoded.into_iter().map(|(_, n)| n).collect::<Vec<_>>();
        assert_eq!(sorted, vec![1, 3, 255, 256, u64::MAX]);
    }

    #[test_log::test]
    fn test_option_and_bytes() {
        test_roundtrip(&Some(vec![1u8, 2, 3]));
        test_roundtrip(&Option::<Vec<u8>>::None);
        test_roundtrip(&(7u32, true, String::from("group")));
    }

    #[test_log::test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = 5u32.consensus_encode_to_vec();
        bytes.push(0);
        assert!(u32::consensus_decode_whole(&bytes).is_err());
    }

    #[test_log::test]
    fn test_invalid_bool() {
        assert!(bool::consensus_decode_whole(&[2]).is_err());
    }

    #[test_log::test]
    fn test_truncated_vec_fails() {
        // claims 10 elements, carries 2
        let mut bytes = 10u64.consensus_encode_to_vec();
        bytes.extend([1, 2]);
        assert!(Vec::<u8>::consensus_decode_whole(&bytes).is_err());
    }
}
