//! Macros for defining typed hash IDs.

/// Macro to define a typed hash ID.
///
/// This generates a newtype wrapper around a 32-byte SHA-256 digest with:
/// - A `LABEL` constant used in debug output
/// - `of()` to hash arbitrary bytes
/// - `from_slice()` / `parse()` for strict decoding
/// - `Display` and `FromStr` over URL-safe base64
/// - `Serialize` and `Deserialize` as the base64 string
///
/// # Example
///
/// ```ignore
/// define_hash_id!(PoolId, "pool");
///
/// let id = PoolId::of(b"contract bytes");
/// let parsed: PoolId = id.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_hash_id {
    ($name:ident, $label:literal) => {
        /// A typed content-hash ID.
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $crate::HASH_LEN]);

        impl $name {
            /// Label for this ID type.
            pub const LABEL: &'static str = $label;

            /// Computes the ID of the given bytes.
            #[must_use]
            pub fn of(data: &[u8]) -> Self {
                Self($crate::digest(data))
            }

            /// Wraps an existing digest.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; $crate::HASH_LEN]) -> Self {
                Self(bytes)
            }

            /// Wraps a digest given as a slice, checking its length.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, $crate::IdError> {
                let digest: [u8; $crate::HASH_LEN] =
                    bytes
                        .try_into()
                        .map_err(|_| $crate::IdError::InvalidLength {
                            expected: $crate::HASH_LEN,
                            actual: bytes.len(),
                        })?;
                Ok(Self(digest))
            }

            /// Returns the raw digest.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; $crate::HASH_LEN] {
                &self.0
            }

            /// Returns true if `data` hashes to this ID.
            #[must_use]
            pub fn matches(&self, data: &[u8]) -> bool {
                $crate::digest(data) == self.0
            }

            /// Parses an ID from its URL-safe base64 form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                let bytes = $crate::decode_base64(s)?;
                Self::from_slice(&bytes)
            }

            /// Returns a short hex prefix, for log lines.
            #[must_use]
            pub fn short(&self) -> String {
                $crate::short_hex(&self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&$crate::encode_base64(&self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", Self::LABEL, self.short())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}
