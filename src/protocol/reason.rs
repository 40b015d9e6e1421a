//! CONNACK and SUBACK return codes

/// CONNACK return codes (v3.1 / v3.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0,
    /// The server does not support the requested protocol level
    UnacceptableProtocolVersion = 1,
    /// The client identifier is not allowed (e.g. longer than the
    /// 23-byte limit enforced by strict v3.1 servers)
    IdentifierRejected = 2,
    /// The service is unavailable
    ServerUnavailable = 3,
    /// Malformed username or password
    BadUsernameOrPassword = 4,
    /// The client is not authorized to connect
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Accepted),
            1 => Some(Self::UnacceptableProtocolVersion),
            2 => Some(Self::IdentifierRejected),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadUsernameOrPassword),
            5 => Some(Self::NotAuthorized),
            _ => None,
        }
    }
}

/// SUBACK return codes: granted QoS, or failure (v3.1.1 addition)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubackReturnCode {
    GrantedQoS0 = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    Failure = 0x80,
}

impl SubackReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::GrantedQoS0),
            0x01 => Some(Self::GrantedQoS1),
            0x02 => Some(Self::GrantedQoS2),
            0x80 => Some(Self::Failure),
            _ => None,
        }
    }

    /// The code granting exactly the requested QoS
    pub fn granted(qos: super::QoS) -> Self {
        match qos {
            super::QoS::AtMostOnce => Self::GrantedQoS0,
            super::QoS::AtLeastOnce => Self::GrantedQoS1,
            super::QoS::ExactlyOnce => Self::GrantedQoS2,
        }
    }
}
