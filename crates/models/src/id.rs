use sqlx::{postgres, Decode, Encode, Type};

use crate::ShardId;

/// Id is the globally unique identifier of a stored record.
/// It's a fixed 8-byte payload which is represented in hexadecimal notation;
/// the top `shard_bits` bits name the shard on which the record resides.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 8]);

impl Id {
    pub fn new(b: [u8; 8]) -> Self {
        Self(b)
    }
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
    pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, hex::FromHexError> {
        let vec_bytes = hex::decode(hex)?;
        let exact: [u8; 8] = vec_bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;

        Ok(Id(exact))
    }
    pub fn as_i64(&self) -> i64 {
        i64::from_be_bytes(self.0)
    }
    pub fn from_i64(i: i64) -> Self {
        Self(i.to_be_bytes())
    }
    /// The shard of residence, taken from the top `shard_bits` bits.
    /// Immutable for the record's lifetime.
    pub fn shard(&self, shard_bits: u32) -> ShardId {
        (self.as_i64() as u64) >> (64 - shard_bits)
    }
}

impl From<i64> for Id {
    fn from(i: i64) -> Self {
        Self::from_i64(i)
    }
}

impl std::str::FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::from_hex(s)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", i64::from_be_bytes(self.0))
    }
}
impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Id::from_hex(str_val.as_ref()).map_err(|err| D::Error::custom(format!("invalid id: {err}")))
    }
}

impl Type<postgres::Postgres> for Id {
    fn type_info() -> postgres::PgTypeInfo {
        <i64 as Type<postgres::Postgres>>::type_info()
    }
    fn compatible(ty: &postgres::PgTypeInfo) -> bool {
        <i64 as Type<postgres::Postgres>>::compatible(ty)
    }
}

impl sqlx::postgres::PgHasArrayType for Id {
    fn array_type_info() -> postgres::PgTypeInfo {
        <i64 as sqlx::postgres::PgHasArrayType>::array_type_info()
    }
}

impl Encode<'_, postgres::Postgres> for Id {
    fn encode_by_ref(&self, buf: &mut postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        <i64 as Encode<'_, postgres::Postgres>>::encode(self.as_i64(), buf)
    }
}

impl Decode<'_, postgres::Postgres> for Id {
    fn decode(value: postgres::PgValueRef<'_>) -> Result<Self, sqlx::error::BoxDynError> {
        <i64 as Decode<'_, postgres::Postgres>>::decode(value).map(Self::from_i64)
    }
}

#[cfg(test)]
mod test {
    use super::Id;

    #[test]
    fn shard_is_top_bits() {
        let id = Id::from_i64(((3u64 << 56) | 42) as i64);
        assert_eq!(id.shard(8), 3);
        assert_eq!(id.shard(4), 0);

        let id = Id::from_i64(((255u64 << 56) | 7) as i64);
        assert_eq!(id.shard(8), 255);
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::from_i64(0x0102030405060708);
        assert_eq!(id.to_string(), "0102030405060708");
        assert_eq!(Id::from_hex("0102030405060708").unwrap(), id);
        assert!(Id::from_hex("0102").is_err());
    }

    #[test]
    fn serde_as_hex_string() {
        let id = Id::from_i64(0x00ff000000000001u64 as i64);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00ff000000000001\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
