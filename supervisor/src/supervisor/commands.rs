//! Operator command language
//!
//! Commands are space-separated printable tokens; only the final argument
//! of `SET_FINGERPRINT` may itself contain spaces. Each command parses once
//! into a tagged variant; dispatch over the enum is exhaustive.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::db::TimeOp;
use crate::state::{valid_vlan_id, MacAddr, MAX_PSK_LEN};

/// Longest accepted protocol name in fingerprint commands.
pub const MAX_PROTOCOL_NAME: usize = 32;

pub const OK_REPLY: &str = "OK";
pub const FAIL_REPLY: &str = "FAIL";
pub const PING_REPLY: &str = "PONG";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command")]
    UnknownCommand,
    #[error("missing argument")]
    MissingArgument,
    #[error("malformed MAC address")]
    BadMac,
    #[error("malformed IP address")]
    BadIp,
    #[error("malformed VLAN id")]
    BadVlan,
    #[error("malformed timestamp")]
    BadTimestamp,
    #[error("malformed comparison operator")]
    BadOp,
    #[error("malformed protocol name")]
    BadProtocol,
    #[error("malformed PSK")]
    BadPsk,
}

/// Whether a `SET_IP` notification adds or removes the lease. The DHCP
/// hook emits `add`, `old` and `del`; any token other than add/old is
/// treated as a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpChange {
    Add,
    Remove,
}

impl IpChange {
    fn from_token(token: &str) -> Self {
        match token {
            "add" | "old" => IpChange::Add,
            _ => IpChange::Remove,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    SubscribeEvents,
    AcceptMac { mac: MacAddr, vlan_id: u16 },
    DenyMac { mac: MacAddr },
    AddNat { mac: MacAddr },
    RemoveNat { mac: MacAddr },
    AssignPsk { mac: MacAddr, psk: String },
    ClearPsk { mac: MacAddr },
    SetIp { change: IpChange, mac: MacAddr, ip: Ipv4Addr },
    AddBridge { left: MacAddr, right: MacAddr },
    RemoveBridge { left: MacAddr, right: MacAddr },
    SetFingerprint {
        src_mac: MacAddr,
        dst_mac: MacAddr,
        protocol: String,
        fingerprint: String,
        timestamp: i64,
        query: String,
    },
    QueryFingerprint {
        mac: MacAddr,
        timestamp: i64,
        op: TimeOp,
        protocol: String,
    },
    RegisterTicket { mac: MacAddr, label: String, vlan_id: u16 },
    GetMap { mac: MacAddr },
    GetAll,
}

fn arg<'a>(tokens: &[&'a str], idx: usize) -> Result<&'a str, ParseError> {
    tokens.get(idx).copied().ok_or(ParseError::MissingArgument)
}

fn parse_mac(token: &str) -> Result<MacAddr, ParseError> {
    token.parse().map_err(|_| ParseError::BadMac)
}

fn parse_vlan(token: &str) -> Result<u16, ParseError> {
    let vlan_id: u16 = token.parse().map_err(|_| ParseError::BadVlan)?;
    if !valid_vlan_id(vlan_id) {
        return Err(ParseError::BadVlan);
    }
    Ok(vlan_id)
}

fn parse_protocol(token: &str) -> Result<String, ParseError> {
    if token.is_empty() || token.len() > MAX_PROTOCOL_NAME {
        return Err(ParseError::BadProtocol);
    }
    Ok(token.to_string())
}

impl Command {
    /// Parse a tokenized command line.
    pub fn parse(tokens: &[&str]) -> Result<Command, ParseError> {
        let name = *tokens.first().ok_or(ParseError::UnknownCommand)?;

        match name {
            "PING" => Ok(Command::Ping),
            "SUBSCRIBE_EVENTS" => Ok(Command::SubscribeEvents),
            "GET_ALL" => Ok(Command::GetAll),
            "ACCEPT_MAC" => Ok(Command::AcceptMac {
                mac: parse_mac(arg(tokens, 1)?)?,
                vlan_id: parse_vlan(arg(tokens, 2)?)?,
            }),
            "DENY_MAC" => Ok(Command::DenyMac {
                mac: parse_mac(arg(tokens, 1)?)?,
            }),
            "ADD_NAT" => Ok(Command::AddNat {
                mac: parse_mac(arg(tokens, 1)?)?,
            }),
            "REMOVE_NAT" => Ok(Command::RemoveNat {
                mac: parse_mac(arg(tokens, 1)?)?,
            }),
            "ASSIGN_PSK" => {
                let mac = parse_mac(arg(tokens, 1)?)?;
                let psk = arg(tokens, 2)?;
                if psk.is_empty() || psk.len() > MAX_PSK_LEN {
                    return Err(ParseError::BadPsk);
                }
                Ok(Command::AssignPsk {
                    mac,
                    psk: psk.to_string(),
                })
            }
            "CLEAR_PSK" => Ok(Command::ClearPsk {
                mac: parse_mac(arg(tokens, 1)?)?,
            }),
            "SET_IP" => {
                let change = IpChange::from_token(arg(tokens, 1)?);
                let mac = parse_mac(arg(tokens, 2)?)?;
                let ip: Ipv4Addr = arg(tokens, 3)?.parse().map_err(|_| ParseError::BadIp)?;
                Ok(Command::SetIp { change, mac, ip })
            }
            "ADD_BRIDGE" => Ok(Command::AddBridge {
                left: parse_mac(arg(tokens, 1)?)?,
                right: parse_mac(arg(tokens, 2)?)?,
            }),
            "REMOVE_BRIDGE" => Ok(Command::RemoveBridge {
                left: parse_mac(arg(tokens, 1)?)?,
                right: parse_mac(arg(tokens, 2)?)?,
            }),
            "SET_FINGERPRINT" => {
                let src_mac = parse_mac(arg(tokens, 1)?)?;
                let dst_mac = parse_mac(arg(tokens, 2)?)?;
                let protocol = parse_protocol(arg(tokens, 3)?)?;
                let fingerprint = arg(tokens, 4)?.to_string();
                let timestamp: i64 = arg(tokens, 5)?
                    .parse()
                    .map_err(|_| ParseError::BadTimestamp)?;
                // The query is the final argument and may contain spaces.
                if tokens.len() < 7 {
                    return Err(ParseError::MissingArgument);
                }
                let query = tokens[6..].join(" ");
                Ok(Command::SetFingerprint {
                    src_mac,
                    dst_mac,
                    protocol,
                    fingerprint,
                    timestamp,
                    query,
                })
            }
            "QUERY_FINGERPRINT" => Ok(Command::QueryFingerprint {
                mac: parse_mac(arg(tokens, 1)?)?,
                timestamp: arg(tokens, 2)?
                    .parse()
                    .map_err(|_| ParseError::BadTimestamp)?,
                op: arg(tokens, 3)?.parse().map_err(|_| ParseError::BadOp)?,
                protocol: parse_protocol(arg(tokens, 4)?)?,
            }),
            "REGISTER_TICKET" => Ok(Command::RegisterTicket {
                mac: parse_mac(arg(tokens, 1)?)?,
                label: arg(tokens, 2)?.to_string(),
                vlan_id: parse_vlan(arg(tokens, 3)?)?,
            }),
            "GET_MAP" => Ok(Command::GetMap {
                mac: parse_mac(arg(tokens, 1)?)?,
            }),
            _ => Err(ParseError::UnknownCommand),
        }
    }
}
