//! Agent protocol messages
//!
//! Message numbers follow draft-miller-ssh-agent. Requests other than sign
//! are decoded by `ssh-agent-lib`; sign requests keep the key blob exactly
//! as sent so certificate identities match byte for byte. Responses are
//! encoded here because `ssh_key::Signature` cannot carry `ssh-rsa`.

use bytes::Bytes;
use ssh_agent_lib::proto;
use ssh_encoding::{CheckedSum, Decode, Encode, Reader, Writer};
use ssh_key::PrivateKey;

use crate::error::ProtocolError;
use crate::identity::PublicKeyEntry;

/// Message numbers
pub mod msg {
    pub const FAILURE: u8 = 5;
    pub const SUCCESS: u8 = 6;
    pub const REQUEST_IDENTITIES: u8 = 11;
    pub const IDENTITIES_ANSWER: u8 = 12;
    pub const SIGN_REQUEST: u8 = 13;
    pub const SIGN_RESPONSE: u8 = 14;
}

/// Signature flags carried by a sign request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SignFlags(u32);

impl SignFlags {
    /// Ask for `rsa-sha2-256` instead of `ssh-rsa`
    pub const RSA_SHA2_256: SignFlags = SignFlags(2);
    /// Ask for `rsa-sha2-512` instead of `ssh-rsa`
    pub const RSA_SHA2_512: SignFlags = SignFlags(4);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// No algorithm selection requested
    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

/// A sign request: key, data to sign and flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub key_blob: Bytes,
    pub data: Bytes,
    pub flags: SignFlags,
}

impl SignRequest {
    /// Parse the body of a sign request (after the message number)
    pub fn parse(mut body: &[u8]) -> Result<Self, ProtocolError> {
        let request = Self::decode(&mut body)?;
        Ok(body.finish(request)?)
    }

    /// Full payload, message number first
    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity([1, self.encoded_len()?].checked_sum()?);
        msg::SIGN_REQUEST.encode(&mut buf)?;
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

impl Decode for SignRequest {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl Reader) -> ssh_encoding::Result<Self> {
        let key_blob = Bytes::decode(reader)?;
        let data = Bytes::decode(reader)?;
        let flags = SignFlags::from_bits(u32::decode(reader)?);
        Ok(Self {
            key_blob,
            data,
            flags,
        })
    }
}

impl Encode for SignRequest {
    fn encoded_len(&self) -> ssh_encoding::Result<usize> {
        [self.key_blob.encoded_len()?, self.data.encoded_len()?, 4].checked_sum()
    }

    fn encode(&self, writer: &mut impl Writer) -> ssh_encoding::Result<()> {
        self.key_blob.encode(writer)?;
        self.data.encode(writer)?;
        self.flags.bits().encode(writer)
    }
}

/// Constraint attached to an added key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// Remove the key after this many seconds
    Lifetime(u32),
    /// Require confirmation before each use
    Confirm,
    /// Vendor extension constraint, kept for logging
    Other(String),
}

impl From<proto::KeyConstraint> for Constraint {
    fn from(constraint: proto::KeyConstraint) -> Self {
        match constraint {
            proto::KeyConstraint::Lifetime(secs) => Constraint::Lifetime(secs),
            proto::KeyConstraint::Confirm => Constraint::Confirm,
            other => Constraint::Other(format!("{:?}", other)),
        }
    }
}

/// A key handed to the agent by `ssh-add`
#[derive(Debug, Clone)]
pub struct AddKey {
    pub key: PrivateKey,
    pub constraints: Vec<Constraint>,
}

impl AddKey {
    pub fn new(key: PrivateKey, constraints: Vec<Constraint>) -> Self {
        Self { key, constraints }
    }

    fn from_identity(
        identity: proto::AddIdentity,
        constraints: Vec<proto::KeyConstraint>,
    ) -> Result<Self, ProtocolError> {
        let key = match identity.credential {
            proto::Credential::Key { privkey, comment } => PrivateKey::new(privkey, comment)?,
            _ => return Err(ProtocolError::UnsupportedCredential),
        };
        Ok(Self::new(
            key,
            constraints.into_iter().map(Constraint::from).collect(),
        ))
    }
}

/// Request from an agent client
#[derive(Debug, Clone)]
pub enum Request {
    RequestIdentities,
    Sign(SignRequest),
    Add(AddKey),
    Remove { key_blob: Bytes },
    RemoveAll,
    Lock { passphrase: String },
    Unlock { passphrase: String },
    /// Well-formed message this agent does not serve
    Unsupported(u8),
}

impl Request {
    /// Decode a full payload, message number first
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (&number, body) = payload.split_first().ok_or(ProtocolError::EmptyMessage)?;
        if number == msg::SIGN_REQUEST {
            return SignRequest::parse(body).map(Request::Sign);
        }

        let mut reader = payload;
        let request = proto::Request::decode(&mut reader)
            .map_err(|e| ProtocolError::Request(e.to_string()))?;

        let request = match request {
            proto::Request::RequestIdentities => Request::RequestIdentities,
            proto::Request::AddIdentity(identity) => {
                Request::Add(AddKey::from_identity(identity, Vec::new())?)
            }
            proto::Request::AddIdConstrained(constrained) => Request::Add(AddKey::from_identity(
                constrained.identity,
                constrained.constraints,
            )?),
            proto::Request::RemoveIdentity(remove) => {
                let mut key_blob = Vec::new();
                remove.pubkey.encode(&mut key_blob)?;
                Request::Remove {
                    key_blob: key_blob.into(),
                }
            }
            proto::Request::RemoveAllIdentities => Request::RemoveAll,
            proto::Request::Lock(passphrase) => Request::Lock { passphrase },
            proto::Request::Unlock(passphrase) => Request::Unlock { passphrase },
            _ => Request::Unsupported(number),
        };
        Ok(request)
    }
}

/// A signature in SSH encoding: format name plus algorithm-specific blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSignature {
    pub format: String,
    pub blob: Bytes,
}

impl AgentSignature {
    pub fn new(format: impl Into<String>, blob: impl Into<Bytes>) -> Self {
        Self {
            format: format.into(),
            blob: blob.into(),
        }
    }

    pub fn from_wire(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let signature = Self::decode(&mut data)?;
        Ok(data.finish(signature)?)
    }
}

impl From<ssh_key::Signature> for AgentSignature {
    fn from(signature: ssh_key::Signature) -> Self {
        Self::new(
            signature.algorithm().as_str(),
            signature.as_bytes().to_vec(),
        )
    }
}

impl Decode for AgentSignature {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl Reader) -> ssh_encoding::Result<Self> {
        let format = String::decode(reader)?;
        let blob = Bytes::decode(reader)?;
        Ok(Self { format, blob })
    }
}

/// `string format || string blob`
impl Encode for AgentSignature {
    fn encoded_len(&self) -> ssh_encoding::Result<usize> {
        [self.format.encoded_len()?, self.blob.encoded_len()?].checked_sum()
    }

    fn encode(&self, writer: &mut impl Writer) -> ssh_encoding::Result<()> {
        self.format.encode(writer)?;
        self.blob.encode(writer)
    }
}

/// Response from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Failure,
    Success,
    Identities(Vec<PublicKeyEntry>),
    Signature(AgentSignature),
}

impl Response {
    /// Encode as a payload, message number first
    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(self.encoded_len()?);
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a full payload, message number first
    pub fn from_payload(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        let response = Self::decode(&mut payload)?;
        Ok(payload.finish(response)?)
    }
}

impl Encode for Response {
    fn encoded_len(&self) -> ssh_encoding::Result<usize> {
        let body = match self {
            Response::Failure | Response::Success => 0,
            Response::Identities(keys) => keys.iter().try_fold(4usize, |len, key| {
                [len, key.blob.encoded_len()?, key.comment.encoded_len()?].checked_sum()
            })?,
            Response::Signature(sig) => sig.encoded_len_prefixed()?,
        };
        [1, body].checked_sum()
    }

    fn encode(&self, writer: &mut impl Writer) -> ssh_encoding::Result<()> {
        match self {
            Response::Failure => msg::FAILURE.encode(writer),
            Response::Success => msg::SUCCESS.encode(writer),
            Response::Identities(keys) => {
                msg::IDENTITIES_ANSWER.encode(writer)?;
                keys.len().encode(writer)?;
                for key in keys {
                    key.blob.encode(writer)?;
                    key.comment.encode(writer)?;
                }
                Ok(())
            }
            Response::Signature(sig) => {
                msg::SIGN_RESPONSE.encode(writer)?;
                sig.encode_prefixed(writer)
            }
        }
    }
}

impl Decode for Response {
    type Error = ProtocolError;

    fn decode(reader: &mut impl Reader) -> Result<Self, ProtocolError> {
        let response = match u8::decode(reader)? {
            msg::FAILURE => Response::Failure,
            msg::SUCCESS => Response::Success,
            msg::IDENTITIES_ANSWER => {
                let count = u32::decode(reader)?;
                let mut keys = Vec::new();
                for _ in 0..count {
                    let blob = Bytes::decode(reader)?;
                    let comment = String::from_utf8_lossy(&Vec::<u8>::decode(reader)?).into_owned();
                    keys.push(PublicKeyEntry::from_blob(blob, comment)?);
                }
                Response::Identities(keys)
            }
            msg::SIGN_RESPONSE => {
                Response::Signature(AgentSignature::from_wire(&Vec::<u8>::decode(reader)?)?)
            }
            other => return Err(ProtocolError::UnexpectedResponse(other)),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use ssh_key::Algorithm;

    fn key_blob() -> Bytes {
        let mut buf = Vec::new();
        "ssh-ed25519".encode(&mut buf).unwrap();
        [1u8; 32].encode(&mut buf).unwrap();
        buf.into()
    }

    /// `ADD_IDENTITY` payload as ssh-add builds it
    fn add_payload(key: &PrivateKey, comment: &str, constraints: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let number: u8 = if constraints.is_empty() { 17 } else { 25 };
        number.encode(&mut buf).unwrap();
        key.key_data().encode(&mut buf).unwrap();
        comment.encode(&mut buf).unwrap();
        buf.extend_from_slice(constraints);
        buf
    }

    #[test]
    fn test_sign_request_decode() {
        let sign = SignRequest {
            key_blob: key_blob(),
            data: Bytes::from_static(b"session data"),
            flags: SignFlags::RSA_SHA2_256,
        };
        let payload = sign.to_payload().unwrap();
        assert_eq!(payload[0], msg::SIGN_REQUEST);
        let Request::Sign(decoded) = Request::decode(&payload).unwrap() else {
            panic!("expected sign request");
        };
        assert_eq!(decoded, sign);
    }

    #[test]
    fn test_certificate_blob_kept_verbatim() {
        let mut cert_blob = Vec::new();
        "ecdsa-sha2-nistp256-cert-v01@openssh.com"
            .encode(&mut cert_blob)
            .unwrap();
        cert_blob.extend_from_slice(&[9; 12]);
        let sign = SignRequest {
            key_blob: cert_blob.clone().into(),
            data: Bytes::from_static(b"d"),
            flags: SignFlags::default(),
        };

        let Request::Sign(decoded) = Request::decode(&sign.to_payload().unwrap()).unwrap() else {
            panic!("expected sign request");
        };
        assert_eq!(decoded.key_blob.as_ref(), cert_blob.as_slice());
    }

    #[test]
    fn test_sign_request_without_flags_is_malformed() {
        let mut body = Vec::new();
        key_blob().encode(&mut body).unwrap();
        b"data".encode(&mut body).unwrap();
        assert!(SignRequest::parse(&body).is_err());
        assert!(SignRequest::parse(&[]).is_err());
    }

    #[test]
    fn test_simple_requests() {
        assert!(matches!(Request::decode(&[11]), Ok(Request::RequestIdentities)));
        assert!(matches!(Request::decode(&[19]), Ok(Request::RemoveAll)));
        assert!(matches!(Request::decode(&[]), Err(ProtocolError::EmptyMessage)));

        let mut lock = vec![22];
        "pw".encode(&mut lock).unwrap();
        let Ok(Request::Lock { passphrase }) = Request::decode(&lock) else {
            panic!("expected lock");
        };
        assert_eq!(passphrase, "pw");
    }

    #[test]
    fn test_unknown_message_number_is_error() {
        assert!(Request::decode(&[200]).is_err());
    }

    #[test]
    fn test_add_identity_with_lifetime() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        // lifetime constraint: id 1, u32 seconds
        let payload = add_payload(&key, "alice", &[1, 0, 0, 0, 30]);

        let Ok(Request::Add(add)) = Request::decode(&payload) else {
            panic!("expected add");
        };
        assert_eq!(add.key.comment(), "alice");
        assert_eq!(add.key.public_key().key_data(), key.public_key().key_data());
        assert_eq!(add.constraints, vec![Constraint::Lifetime(30)]);
    }

    #[test]
    fn test_remove_identity_yields_blob() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let blob = key.public_key().to_bytes().unwrap();
        let mut payload = vec![18];
        blob.encode(&mut payload).unwrap();

        let Ok(Request::Remove { key_blob }) = Request::decode(&payload) else {
            panic!("expected remove");
        };
        assert_eq!(key_blob.as_ref(), blob.as_slice());
    }

    #[test]
    fn test_identities_answer_layout() {
        let entry = PublicKeyEntry::from_blob(key_blob(), "card").unwrap();
        let payload = Response::Identities(vec![entry.clone()]).to_payload().unwrap();

        assert_eq!(payload[0], msg::IDENTITIES_ANSWER);
        assert_eq!(&payload[1..5], &[0, 0, 0, 1]);
        assert_eq!(
            Response::from_payload(&payload).unwrap(),
            Response::Identities(vec![entry])
        );
    }

    #[test]
    fn test_empty_identities_answer() {
        let payload = Response::Identities(Vec::new()).to_payload().unwrap();
        assert_eq!(payload, vec![msg::IDENTITIES_ANSWER, 0, 0, 0, 0]);
        assert_eq!(Response::Failure.to_payload().unwrap(), vec![msg::FAILURE]);
    }

    #[test]
    fn test_legacy_rsa_signature_response() {
        let sig = AgentSignature::new("ssh-rsa", vec![0xAB; 4]);
        let payload = Response::Signature(sig.clone()).to_payload().unwrap();
        // outer string length = 4 + 7 + 4 + 4
        assert_eq!(&payload[1..5], &[0, 0, 0, 19]);
        assert_eq!(Response::from_payload(&payload).unwrap(), Response::Signature(sig));
    }

    #[test]
    fn test_unexpected_response_number() {
        assert!(matches!(
            Response::from_payload(&[13]),
            Err(ProtocolError::UnexpectedResponse(13))
        ));
    }

    #[test]
    fn test_sign_flags() {
        assert!(SignFlags::default().is_default());
        assert_eq!(SignFlags::RSA_SHA2_512.bits(), 4);
    }
}
