pub mod onion;
pub mod split;
pub mod tlv;
