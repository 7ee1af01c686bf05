//! Shared protocol constants for the AMQP 1.0 establishment phase

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"AMQP";
pub const VERSION: [u8; 3] = [1, 0, 0];
pub const PROTO_HEADER_SIZE: usize = 8;

// Frame header: SIZE (4) | DOFF (1) | TYPE (1) | CHANNEL (2)
pub const FRAME_HEADER_SIZE: usize = 8;

// Max frame size advertised and assumed for the peer until its OPEN arrives
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 512;

// Hard ceiling on a declared frame size, independent of negotiated limits
pub const MAX_DECLARED_FRAME_SIZE: u32 = i32::MAX as u32;

// Protocol IDs carried in protocol headers
pub mod proto {
    pub const AMQP: u8 = 0x00;
    pub const TLS: u8 = 0x02;
    pub const SASL: u8 = 0x03;
}

// Frame type tags (byte 5 of the frame header)
pub mod frame_type {
    pub const AMQP: u8 = 0x00;
    pub const SASL: u8 = 0x01;
}

// Descriptor codes for the performatives this crate understands
pub mod descriptor {
    pub const OPEN: u64 = 0x10;
    pub const BEGIN: u64 = 0x11;
    pub const CLOSE: u64 = 0x18;
    pub const ERROR: u64 = 0x1d;
    pub const SASL_MECHANISMS: u64 = 0x40;
    pub const SASL_INIT: u64 = 0x41;
    pub const SASL_CHALLENGE: u64 = 0x42;
    pub const SASL_RESPONSE: u64 = 0x43;
    pub const SASL_OUTCOME: u64 = 0x44;
}

// Error conditions sent in CLOSE frames
pub mod condition {
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
}

// Keys and capabilities placed on our OPEN
pub mod open_props {
    pub const PRODUCT: &str = "product";
    pub const PRODUCT_NAME: &str = "amqpd";
    pub const AUTHENTICATED_IDENTITY: &str = "authenticated-identity";
    pub const GROUPS: &str = "groups";
    pub const ADDRESS_AUTHZ_CAPABILITY: &str = "ADDRESS-AUTHZ";
}

// Centralized timeout constants
pub mod timeouts {
    // Per-operation deadline while establishing a connection (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Whole-negotiation window granted by the listener (ms)
    pub const NEGOTIATION_MS: u64 = 10_000;
}
