use serde::{
    de::{Error, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Node identifier as used by `cln_rpc`.
pub type PublicKey = cln_rpc::primitives::PublicKey;

/// Represents a short channel id. Matches with the implementation in cln_rpc.
pub type ShortChannelId = cln_rpc::primitives::ShortChannelId;

const PPM_DENOMINATOR: u128 = 1_000_000;

/// A monetary amount in millisatoshi. Serialized as a plain integer, which is
/// how `lightningd` reports `*_msat` fields.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Msat(pub u64);

impl Msat {
    pub const ZERO: Msat = Msat(0);

    /// Constructs a new `Msat` struct from a `u64`.
    pub const fn from_msat(msat: u64) -> Self {
        Msat(msat)
    }

    /// Returns the msat value as `u64`. Is the inner value of `Msat`.
    pub fn msat(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Msat) -> Option<Msat> {
        self.0.checked_add(other.0).map(Msat)
    }

    pub fn checked_sub(self, other: Msat) -> Option<Msat> {
        self.0.checked_sub(other.0).map(Msat)
    }
}

impl core::fmt::Display for Msat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

/// Parts-per-million, used for the proportional part of a channel fee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ppm(pub u32);

impl Ppm {
    /// Applies the proportion to a base amount, rounding up. Returns `None`
    /// if the result does not fit a `u64`.
    pub fn apply_to_ceil(&self, base_msat: u64) -> Option<u64> {
        let product = base_msat as u128 * self.0 as u128;
        let rounded = product.div_ceil(PPM_DENOMINATOR);
        u64::try_from(rounded).ok()
    }
}

impl core::fmt::Display for Ppm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}ppm", self.0)
    }
}

/// The fee a channel charges for forwarding, as advertised in its
/// `channel_update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeePolicy {
    pub base: Msat,
    pub proportional: Ppm,
}

impl FeePolicy {
    pub fn new(base: Msat, proportional: Ppm) -> Self {
        Self { base, proportional }
    }

    /// `base + ceil(amount * ppm / 1_000_000)`.
    pub fn fee_for(&self, amount: Msat) -> Option<Msat> {
        let proportional = self.proportional.apply_to_ceil(amount.msat())?;
        self.base.checked_add(Msat(proportional))
    }

    /// The amount a peer must receive to forward `amount` over this channel.
    pub fn amount_with_fee(&self, amount: Msat) -> Option<Msat> {
        amount.checked_add(self.fee_for(amount)?)
    }
}

macro_rules! hash32 {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; 32]>::try_from(bytes).ok().map($name)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut out = [0u8; 32];
                hex::decode_to_slice(s, &mut out)?;
                Ok($name(out))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct HexVisitor;

                impl<'de> Visitor<'de> for HexVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                        f.write_str("a 64-character hex string")
                    }

                    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
                    where
                        E: Error,
                    {
                        value.parse().map_err(|e| {
                            Error::custom(format!("invalid {} '{}': {}", stringify!($name), value, e))
                        })
                    }
                }

                deserializer.deserialize_str(HexVisitor)
            }
        }
    };
}

hash32!(PaymentHash, "The SHA256 payment hash identifying a payment and all of its legs.");
hash32!(Preimage, "The secret whose hash is the payment hash; settles every leg.");

impl Preimage {
    pub fn payment_hash(&self) -> PaymentHash {
        let digest = Sha256::digest(self.0);
        PaymentHash(digest.into())
    }

    /// Returns true if this preimage settles `hash`.
    pub fn matches(&self, hash: &PaymentHash) -> bool {
        self.payment_hash() == *hash
    }
}
