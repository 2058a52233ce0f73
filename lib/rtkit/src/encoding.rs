/// Base64 plumbing shared by the wire protocol (raw data frames) and the
/// login exchange (opaque challenge/response blobs travel base64 on the
/// otherwise line-oriented command channel).
pub mod base64 {
    pub use base64::DecodeError;

    #[inline]
    pub fn encode<T: AsRef<[u8]>>(input: T) -> String {
        ::base64::encode(input.as_ref())
    }

    #[inline]
    pub fn decode(input: &str) -> Result<Vec<u8>, DecodeError> {
        ::base64::decode(input)
    }

    /// Serializes a byte slice as a base64 string. Used with
    /// `#[serde(serialize_with = ...)]` on key material in configuration
    /// structures.
    #[inline]
    pub fn serialize<S, T>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&encode(bytes))
    }
}
