//! RADIUS wire format
//!
//! RFC 2865 packet and attribute codec plus the keyed digests the server
//! needs: response authenticator, User-Password reversal, RFC 2869
//! Message-Authenticator and the RFC 2868 Tunnel-Password salt encryption.

use anyhow::{bail, Result};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;

type HmacMd5 = Hmac<Md5>;

pub const CODE_ACCESS_REQUEST: u8 = 1;
pub const CODE_ACCESS_ACCEPT: u8 = 2;
pub const CODE_ACCESS_REJECT: u8 = 3;

/// RADIUS header length (code, id, length, authenticator).
pub const HEADER_LEN: usize = 20;

/// Largest packet we accept or emit.
pub const MAX_PACKET: usize = 4096;

/// Attribute types used by this server.
pub mod attr {
    pub const USER_NAME: u8 = 1;
    pub const USER_PASSWORD: u8 = 2;
    pub const NAS_IP_ADDRESS: u8 = 4;
    pub const REPLY_MESSAGE: u8 = 18;
    pub const CALLED_STATION_ID: u8 = 30;
    pub const CALLING_STATION_ID: u8 = 31;
    pub const TUNNEL_TYPE: u8 = 64;
    pub const TUNNEL_MEDIUM_TYPE: u8 = 65;
    pub const TUNNEL_PASSWORD: u8 = 69;
    pub const EAP_MESSAGE: u8 = 79;
    pub const MESSAGE_AUTHENTICATOR: u8 = 80;
    pub const TUNNEL_PRIVATE_GROUP_ID: u8 = 81;
}

/// Tunnel-Type value for VLAN.
pub const TUNNEL_TYPE_VLAN: u32 = 13;
/// Tunnel-Medium-Type value for IEEE-802.
pub const TUNNEL_MEDIUM_IEEE_802: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub typ: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub code: u8,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub attributes: Vec<Attribute>,
}

impl Packet {
    pub fn new(code: u8, identifier: u8) -> Self {
        Self {
            code,
            identifier,
            authenticator: [0u8; 16],
            attributes: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            bail!("packet too short: {} bytes", data.len());
        }
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < HEADER_LEN || length > data.len() || length > MAX_PACKET {
            bail!("bad packet length field: {}", length);
        }

        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&data[4..20]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < length {
            if length - offset < 2 {
                bail!("truncated attribute header");
            }
            let typ = data[offset];
            let alen = data[offset + 1] as usize;
            if alen < 2 || offset + alen > length {
                bail!("bad attribute length: {}", alen);
            }
            attributes.push(Attribute {
                typ,
                value: data[offset + 2..offset + alen].to_vec(),
            });
            offset += alen;
        }

        Ok(Self {
            code: data[0],
            identifier: data[1],
            authenticator,
            attributes,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 64);
        out.push(self.code);
        out.push(self.identifier);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.authenticator);
        for attribute in &self.attributes {
            out.push(attribute.typ);
            out.push((attribute.value.len() + 2) as u8);
            out.extend_from_slice(&attribute.value);
        }
        let length = (out.len() as u16).to_be_bytes();
        out[2] = length[0];
        out[3] = length[1];
        out
    }

    pub fn first(&self, typ: u8) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.typ == typ)
            .map(|a| a.value.as_slice())
    }

    pub fn push(&mut self, typ: u8, value: Vec<u8>) {
        self.attributes.push(Attribute { typ, value });
    }

    /// Tagged 32-bit integer attribute (tag 0x00), as used by the tunnel
    /// attributes.
    pub fn push_tagged_u32(&mut self, typ: u8, value: u32) {
        let bytes = value.to_be_bytes();
        // Tag replaces the high byte of the integer field.
        self.push(typ, vec![0x00, bytes[1], bytes[2], bytes[3]]);
    }
}

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Finalize a reply in place: compute the Message-Authenticator (if the
/// attribute slot is present) and the response authenticator, both over
/// the request authenticator per RFC 2865/2869.
pub fn seal_response(reply: &mut Packet, request_auth: &[u8; 16], secret: &[u8]) {
    reply.authenticator = *request_auth;

    if reply
        .attributes
        .iter()
        .any(|a| a.typ == attr::MESSAGE_AUTHENTICATOR)
    {
        for attribute in reply
            .attributes
            .iter_mut()
            .filter(|a| a.typ == attr::MESSAGE_AUTHENTICATOR)
        {
            attribute.value = vec![0u8; 16];
        }
        let digest = hmac_md5(secret, &reply.encode());
        for attribute in reply
            .attributes
            .iter_mut()
            .filter(|a| a.typ == attr::MESSAGE_AUTHENTICATOR)
        {
            attribute.value = digest.to_vec();
        }
    }

    let encoded = reply.encode();
    reply.authenticator = md5(&[&encoded, secret]);
}

/// Check a request's Message-Authenticator. Requests without one pass.
pub fn verify_message_authenticator(request: &Packet, secret: &[u8]) -> bool {
    let Some(claimed) = request.first(attr::MESSAGE_AUTHENTICATOR).map(<[u8]>::to_vec) else {
        return true;
    };
    if claimed.len() != 16 {
        return false;
    }

    let mut zeroed = request.clone();
    for attribute in zeroed
        .attributes
        .iter_mut()
        .filter(|a| a.typ == attr::MESSAGE_AUTHENTICATOR)
    {
        attribute.value = vec![0u8; 16];
    }
    hmac_md5(secret, &zeroed.encode()).as_slice() == claimed.as_slice()
}

fn hmac_md5(secret: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Reverse the RFC 2865 §5.2 User-Password hiding.
pub fn user_password_unhide(secret: &[u8], request_auth: &[u8; 16], hidden: &[u8]) -> Result<Vec<u8>> {
    if hidden.is_empty() || hidden.len() % 16 != 0 {
        bail!("hidden password length {} is not a multiple of 16", hidden.len());
    }

    let mut plain = Vec::with_capacity(hidden.len());
    let mut digest = md5(&[secret, request_auth]);
    for chunk in hidden.chunks(16) {
        for (i, byte) in chunk.iter().enumerate() {
            plain.push(byte ^ digest[i]);
        }
        digest = md5(&[secret, chunk]);
    }

    while plain.last() == Some(&0) {
        plain.pop();
    }
    Ok(plain)
}

/// Apply the RFC 2865 §5.2 User-Password hiding.
pub fn user_password_hide(secret: &[u8], request_auth: &[u8; 16], password: &[u8]) -> Vec<u8> {
    let mut padded = password.to_vec();
    if padded.is_empty() {
        padded.resize(16, 0);
    } else {
        let pad = (16 - padded.len() % 16) % 16;
        padded.extend(std::iter::repeat(0).take(pad));
    }

    let mut hidden = Vec::with_capacity(padded.len());
    let mut digest = md5(&[secret, request_auth]);
    for chunk in padded.chunks(16) {
        let start = hidden.len();
        for (i, byte) in chunk.iter().enumerate() {
            hidden.push(byte ^ digest[i]);
        }
        digest = md5(&[secret, &hidden[start..start + 16]]);
    }
    hidden
}

/// Fresh Tunnel-Password salt: 16 random bits with the top bit set.
pub fn random_tunnel_salt() -> [u8; 2] {
    let mut salt = [0u8; 2];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt[0] |= 0x80;
    salt
}

/// RFC 2868 §3.5 Tunnel-Password encryption. Returns salt plus ciphertext
/// (the caller prepends the tag byte).
pub fn tunnel_password_encrypt(
    secret: &[u8],
    request_auth: &[u8; 16],
    salt: [u8; 2],
    password: &[u8],
) -> Vec<u8> {
    // Plaintext starts with the password length, padded to 16.
    let mut plain = Vec::with_capacity(password.len() + 1);
    plain.push(password.len() as u8);
    plain.extend_from_slice(password);
    let pad = (16 - plain.len() % 16) % 16;
    plain.extend(std::iter::repeat(0).take(pad));

    let mut out = Vec::with_capacity(2 + plain.len());
    out.extend_from_slice(&salt);

    let mut digest = md5(&[secret, request_auth, &salt]);
    for chunk in plain.chunks(16) {
        let start = out.len();
        for (i, byte) in chunk.iter().enumerate() {
            out.push(byte ^ digest[i]);
        }
        digest = md5(&[secret, &out[start..start + 16]]);
    }
    out
}

/// Reverse [`tunnel_password_encrypt`]. `value` is salt plus ciphertext.
pub fn tunnel_password_decrypt(
    secret: &[u8],
    request_auth: &[u8; 16],
    value: &[u8],
) -> Result<Vec<u8>> {
    if value.len() < 18 || (value.len() - 2) % 16 != 0 {
        bail!("bad tunnel password length: {}", value.len());
    }
    let (salt, cipher) = value.split_at(2);
    if salt[0] & 0x80 == 0 {
        bail!("tunnel password salt missing the set top bit");
    }

    let mut plain = Vec::with_capacity(cipher.len());
    let mut digest = md5(&[secret, request_auth, salt]);
    for chunk in cipher.chunks(16) {
        for (i, byte) in chunk.iter().enumerate() {
            plain.push(byte ^ digest[i]);
        }
        digest = md5(&[secret, chunk]);
    }

    let len = plain[0] as usize;
    if len > plain.len() - 1 {
        bail!("tunnel password length byte out of range: {}", len);
    }
    Ok(plain[1..1 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_auth() -> [u8; 16] {
        let mut auth = [0u8; 16];
        for (i, byte) in auth.iter_mut().enumerate() {
            *byte = i as u8;
        }
        auth
    }

    #[test]
    fn test_parse_encode_roundtrip() {
        let mut packet = Packet::new(CODE_ACCESS_REQUEST, 42);
        packet.authenticator = request_auth();
        packet.push(attr::USER_NAME, b"aabbccddeeff".to_vec());
        packet.push_tagged_u32(attr::TUNNEL_TYPE, TUNNEL_TYPE_VLAN);

        let bytes = packet.encode();
        let parsed = Packet::parse(&bytes).unwrap();

        assert_eq!(parsed.code, CODE_ACCESS_REQUEST);
        assert_eq!(parsed.identifier, 42);
        assert_eq!(parsed.authenticator, request_auth());
        assert_eq!(parsed.attributes, packet.attributes);
        assert_eq!(parsed.encode(), bytes);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Packet::parse(&[1, 2, 3]).is_err());

        // Length field larger than the buffer.
        let mut bytes = Packet::new(CODE_ACCESS_REQUEST, 0).encode();
        bytes[3] = 0xff;
        assert!(Packet::parse(&bytes).is_err());

        // Attribute length below the 2-byte minimum.
        let mut packet = Packet::new(CODE_ACCESS_REQUEST, 0);
        packet.push(attr::USER_NAME, b"x".to_vec());
        let mut bytes = packet.encode();
        bytes[HEADER_LEN + 1] = 1;
        assert!(Packet::parse(&bytes).is_err());
    }

    #[test]
    fn test_user_password_roundtrip() {
        let secret = b"radius-secret";
        let auth = request_auth();

        let passwords: [&[u8]; 3] = [
            b"pw",
            b"exactly16bytes!!",
            b"a much longer passphrase than one block",
        ];
        for password in passwords {
            let hidden = user_password_hide(secret, &auth, password);
            assert_eq!(hidden.len() % 16, 0);
            assert_ne!(hidden, password);
            let unhidden = user_password_unhide(secret, &auth, &hidden).unwrap();
            assert_eq!(unhidden, password);
        }
    }

    #[test]
    fn test_tunnel_password_roundtrip() {
        let secret = b"radius-secret";
        let auth = request_auth();
        let salt = [0x8a, 0x21];

        let value = tunnel_password_encrypt(secret, &auth, salt, b"vlan-psk-123");
        assert_eq!(&value[..2], &salt);
        let plain = tunnel_password_decrypt(secret, &auth, &value).unwrap();
        assert_eq!(plain, b"vlan-psk-123");
    }

    #[test]
    fn test_tunnel_password_same_inputs_same_bytes() {
        let secret = b"radius-secret";
        let auth = request_auth();
        let salt = [0xc0, 0x01];

        let a = tunnel_password_encrypt(secret, &auth, salt, b"psk");
        let b = tunnel_password_encrypt(secret, &auth, salt, b"psk");
        assert_eq!(a, b);
    }

    #[test]
    fn test_tunnel_salt_top_bit() {
        for _ in 0..16 {
            let salt = random_tunnel_salt();
            assert!(salt[0] & 0x80 != 0);
        }
    }

    #[test]
    fn test_tunnel_password_rejects_clear_salt() {
        let secret = b"s";
        let auth = request_auth();
        let mut value = tunnel_password_encrypt(secret, &auth, [0x81, 0], b"psk");
        value[0] &= 0x7f;
        assert!(tunnel_password_decrypt(secret, &auth, &value).is_err());
    }

    #[test]
    fn test_message_authenticator_verify() {
        let secret = b"radius-secret";
        let mut request = Packet::new(CODE_ACCESS_REQUEST, 7);
        request.authenticator = request_auth();
        request.push(attr::USER_NAME, b"aabbccddeeff".to_vec());
        request.push(attr::MESSAGE_AUTHENTICATOR, vec![0u8; 16]);

        // Fill in a valid digest the way a client would.
        let digest = hmac_md5(secret, &request.encode());
        request
            .attributes
            .iter_mut()
            .find(|a| a.typ == attr::MESSAGE_AUTHENTICATOR)
            .unwrap()
            .value = digest.to_vec();

        assert!(verify_message_authenticator(&request, secret));
        assert!(!verify_message_authenticator(&request, b"wrong-secret"));

        // Requests without the attribute pass.
        let bare = Packet::new(CODE_ACCESS_REQUEST, 7);
        assert!(verify_message_authenticator(&bare, secret));
    }

    #[test]
    fn test_seal_response_authenticator() {
        let secret = b"radius-secret";
        let auth = request_auth();

        let mut reply = Packet::new(CODE_ACCESS_ACCEPT, 7);
        reply.push_tagged_u32(attr::TUNNEL_TYPE, TUNNEL_TYPE_VLAN);
        reply.push(attr::MESSAGE_AUTHENTICATOR, vec![0u8; 16]);
        seal_response(&mut reply, &auth, secret);

        // Recompute by hand: response auth = MD5(packet-with-request-auth || secret).
        let mut check = reply.clone();
        check.authenticator = auth;
        let expected = md5(&[&check.encode(), &secret[..]]);
        assert_eq!(reply.authenticator, expected);

        // Sealing twice with the same request authenticator is stable.
        let mut again = Packet::new(CODE_ACCESS_ACCEPT, 7);
        again.push_tagged_u32(attr::TUNNEL_TYPE, TUNNEL_TYPE_VLAN);
        again.push(attr::MESSAGE_AUTHENTICATOR, vec![0u8; 16]);
        seal_response(&mut again, &auth, secret);
        assert_eq!(again.encode(), reply.encode());
    }
}
