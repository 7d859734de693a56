use rand::RngCore;

/// An opaque call id / call token: 128 bits of randomness, hex-encoded.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A SIP password: at least 64 bits of randomness, hex-encoded.
pub fn random_sip_password() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn inbound_endpoint_id(call_id: &str) -> String {
    format!("{}{}", models::INBOUND_ENDPOINT_PREFIX, call_id)
}

pub fn outbound_endpoint_id() -> String {
    format!("{}{}", models::OUTBOUND_ENDPOINT_PREFIX, uuid::Uuid::new_v4().simple())
}
