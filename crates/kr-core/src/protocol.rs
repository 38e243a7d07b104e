//! Request/response envelopes exchanged with the phone.
//!
//! On the wire each message is a JSON object with one optional field per
//! payload variant (`sign_request`, `me_request`, ...). Internally the
//! payload is a tagged sum; conversion validates that at most one variant
//! is present.

use std::time::{SystemTime, UNIX_EPOCH};

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::armor::{armor, SIGNATURE_BLOCK};
use crate::errors::ProtocolError;
use crate::profile::Profile;

/// Protocol version advertised to the phone.
pub const CURRENT_VERSION: Version = Version::new(2, 3, 0);

/// First enclave version that signs with `rsa-sha2-256` / `rsa-sha2-512`.
pub const RSA_SHA2_MIN_VERSION: Version = Version::new(2, 3, 0);

pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = Option::<String>::deserialize(d)?.unwrap_or_default();
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => s.serialize_str(&STANDARD.encode(b)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(s) => STANDARD.decode(s).map(Some).map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeResponse {
    pub me: Profile,
}

/// Host-key verification context attached to a sign request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuth {
    #[serde(with = "b64")]
    pub host_key: Vec<u8>,
    #[serde(default, with = "b64::option", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default)]
    pub host_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// SHA-256 of the wire public key.
    #[serde(with = "b64")]
    pub public_key_fingerprint: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_auth: Option<HostAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    Pinned,
    TrustedOnce,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    #[serde(default, with = "b64::option", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_policy: Option<HostKeyPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub tree: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub author: String,
    pub committer: String,
    #[serde(with = "b64")]
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    pub object: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub tagger: String,
    #[serde(with = "b64")]
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSignRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<TagInfo>,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSignResponse {
    #[serde(default, with = "b64::option", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GitSignResponse {
    pub fn ascii_armor_signature(&self) -> Result<String, ProtocolError> {
        let sig = self.signature.as_ref().ok_or(ProtocolError::Missing("signature"))?;
        Ok(armor(SIGNATURE_BLOCK, &[("Comment", "Created With Kryptonite")], sig))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpairRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpairResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_filter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAndHost {
    pub user: String,
    pub host: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsResponse {
    #[serde(default)]
    pub pgp_user_ids: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<UserAndHost>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {}

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// No payload; drains the mailbox and keeps the push endpoint warm.
    NoOp,
    Me(MeRequest),
    Sign(SignRequest),
    GitSign(GitSignRequest),
    Unpair(UnpairRequest),
    CreateTeam(Value),
    AdminKey(Value),
    List(ListRequest),
    Hosts(HostsRequest),
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::NoOp => "noop",
            RequestBody::Me(_) => "me",
            RequestBody::Sign(_) => "sign",
            RequestBody::GitSign(_) => "git_sign",
            RequestBody::Unpair(_) => "unpair",
            RequestBody::CreateTeam(_) => "create_team",
            RequestBody::AdminKey(_) => "admin_key",
            RequestBody::List(_) => "list",
            RequestBody::Hosts(_) => "hosts",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RequestWire", into = "RequestWire")]
pub struct Request {
    pub request_id: String,
    pub unix_seconds: i64,
    pub version: Version,
    pub send_ack: bool,
    pub body: RequestBody,
}

impl Request {
    /// Fresh request with a random 128-bit base62 id.
    pub fn new(body: RequestBody) -> Result<Self, ProtocolError> {
        let request_id =
            kr_crypto::random::rand_128_base62().map_err(|_| ProtocolError::Rng)?;
        Ok(Self {
            request_id,
            unix_seconds: now_unix(),
            version: CURRENT_VERSION,
            send_ack: false,
            body,
        })
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.body, RequestBody::NoOp)
    }

    /// Signing requests need explicit approval on the phone unless an
    /// approval window is open.
    pub fn needs_approval(&self) -> bool {
        matches!(self.body, RequestBody::Sign(_) | RequestBody::GitSign(_))
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RequestWire {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    unix_seconds: i64,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    version: Option<Version>,
    #[serde(rename = "a", default)]
    send_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    me_request: Option<MeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sign_request: Option<SignRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git_sign_request: Option<GitSignRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unpair_request: Option<UnpairRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create_team_request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    admin_key_request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    list_request: Option<ListRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hosts_request: Option<HostsRequest>,
}

/// Collect the present variants; more than one is a protocol error.
fn single_variant<T>(candidates: Vec<(&'static str, Option<T>)>) -> Result<Option<T>, ProtocolError> {
    let present: Vec<(&'static str, T)> = candidates
        .into_iter()
        .filter_map(|(name, v)| v.map(|v| (name, v)))
        .collect();
    if present.len() > 1 {
        let names: Vec<&str> = present.iter().map(|(n, _)| *n).collect();
        return Err(ProtocolError::MultipleVariants(names.join(",")));
    }
    Ok(present.into_iter().next().map(|(_, v)| v))
}

impl TryFrom<RequestWire> for Request {
    type Error = ProtocolError;

    fn try_from(w: RequestWire) -> Result<Self, Self::Error> {
        let body = single_variant(vec![
            ("me_request", w.me_request.map(RequestBody::Me)),
            ("sign_request", w.sign_request.map(RequestBody::Sign)),
            ("git_sign_request", w.git_sign_request.map(RequestBody::GitSign)),
            ("unpair_request", w.unpair_request.map(RequestBody::Unpair)),
            ("create_team_request", w.create_team_request.map(RequestBody::CreateTeam)),
            ("admin_key_request", w.admin_key_request.map(RequestBody::AdminKey)),
            ("list_request", w.list_request.map(RequestBody::List)),
            ("hosts_request", w.hosts_request.map(RequestBody::Hosts)),
        ])?
        .unwrap_or(RequestBody::NoOp);

        Ok(Request {
            request_id: w.request_id,
            unix_seconds: w.unix_seconds,
            version: w.version.unwrap_or(CURRENT_VERSION),
            send_ack: w.send_ack,
            body,
        })
    }
}

impl From<Request> for RequestWire {
    fn from(r: Request) -> Self {
        let mut w = RequestWire {
            request_id: r.request_id,
            unix_seconds: r.unix_seconds,
            version: Some(r.version),
            send_ack: r.send_ack,
            ..Default::default()
        };
        match r.body {
            RequestBody::NoOp => {}
            RequestBody::Me(m) => w.me_request = Some(m),
            RequestBody::Sign(s) => w.sign_request = Some(s),
            RequestBody::GitSign(g) => w.git_sign_request = Some(g),
            RequestBody::Unpair(u) => w.unpair_request = Some(u),
            RequestBody::CreateTeam(v) => w.create_team_request = Some(v),
            RequestBody::AdminKey(v) => w.admin_key_request = Some(v),
            RequestBody::List(l) => w.list_request = Some(l),
            RequestBody::Hosts(h) => w.hosts_request = Some(h),
        }
        w
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Me(MeResponse),
    Sign(SignResponse),
    GitSign(GitSignResponse),
    Unpair(UnpairResponse),
    CreateTeam(Value),
    AdminKey(Value),
    List(ListResponse),
    Hosts(HostsResponse),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResponseWire", into = "ResponseWire")]
pub struct Response {
    pub request_id: String,
    pub version: Option<Version>,
    pub body: Option<ResponseBody>,
    pub ack: bool,
    pub sns_endpoint_arn: Option<String>,
    pub approved_until: Option<i64>,
    pub tracking_id: Option<String>,
}

impl Response {
    pub fn new(request_id: impl Into<String>, body: Option<ResponseBody>) -> Self {
        Self {
            request_id: request_id.into(),
            version: Some(CURRENT_VERSION),
            body,
            ..Default::default()
        }
    }

    /// An ACK without a payload: the phone is working on the request.
    pub fn is_ack_only(&self) -> bool {
        self.ack && self.body.is_none()
    }

    pub fn is_unpair(&self) -> bool {
        matches!(self.body, Some(ResponseBody::Unpair(_)))
    }

    /// Error string reported by the phone in a signing response.
    pub fn error(&self) -> Option<&str> {
        match &self.body {
            Some(ResponseBody::Sign(s)) => s.error.as_deref(),
            Some(ResponseBody::GitSign(g)) => g.error.as_deref(),
            _ => None,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct ResponseWire {
    #[serde(default)]
    request_id: String,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    me_response: Option<MeResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sign_response: Option<SignResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git_sign_response: Option<GitSignResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unpair_response: Option<UnpairResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create_team_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    admin_key_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    list_response: Option<ListResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hosts_response: Option<HostsResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack_response: Option<AckResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sns_endpoint_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    approved_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tracking_id: Option<String>,
}

impl TryFrom<ResponseWire> for Response {
    type Error = ProtocolError;

    fn try_from(w: ResponseWire) -> Result<Self, Self::Error> {
        let body = single_variant(vec![
            ("me_response", w.me_response.map(ResponseBody::Me)),
            ("sign_response", w.sign_response.map(ResponseBody::Sign)),
            ("git_sign_response", w.git_sign_response.map(ResponseBody::GitSign)),
            ("unpair_response", w.unpair_response.map(ResponseBody::Unpair)),
            ("create_team_response", w.create_team_response.map(ResponseBody::CreateTeam)),
            ("admin_key_response", w.admin_key_response.map(ResponseBody::AdminKey)),
            ("list_response", w.list_response.map(ResponseBody::List)),
            ("hosts_response", w.hosts_response.map(ResponseBody::Hosts)),
        ])?;

        Ok(Response {
            request_id: w.request_id,
            version: w.version,
            body,
            ack: w.ack_response.is_some(),
            sns_endpoint_arn: w.sns_endpoint_arn,
            approved_until: w.approved_until,
            tracking_id: w.tracking_id,
        })
    }
}

impl From<Response> for ResponseWire {
    fn from(r: Response) -> Self {
        let mut w = ResponseWire {
            request_id: r.request_id,
            version: r.version,
            ack_response: r.ack.then(AckResponse::default),
            sns_endpoint_arn: r.sns_endpoint_arn,
            approved_until: r.approved_until,
            tracking_id: r.tracking_id,
            ..Default::default()
        };
        match r.body {
            None => {}
            Some(ResponseBody::Me(m)) => w.me_response = Some(m),
            Some(ResponseBody::Sign(s)) => w.sign_response = Some(s),
            Some(ResponseBody::GitSign(g)) => w.git_sign_response = Some(g),
            Some(ResponseBody::Unpair(u)) => w.unpair_response = Some(u),
            Some(ResponseBody::CreateTeam(v)) => w.create_team_response = Some(v),
            Some(ResponseBody::AdminKey(v)) => w.admin_key_response = Some(v),
            Some(ResponseBody::List(l)) => w.list_response = Some(l),
            Some(ResponseBody::Hosts(h)) => w.hosts_response = Some(h),
        }
        w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign_body() -> RequestBody {
        RequestBody::Sign(SignRequest {
            data: vec![0u8; 32],
            public_key_fingerprint: vec![1u8; 32],
            command: None,
            host_auth: None,
        })
    }

    #[test]
    fn request_uses_wire_keys() {
        let mut req = Request::new(sign_body()).unwrap();
        req.send_ack = true;
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["a"], json!(true));
        assert_eq!(v["v"], json!("2.3.0"));
        assert!(v["sign_request"]["data"].is_string());
        assert!(v.get("me_request").is_none());
        assert_eq!(v["request_id"], json!(req.request_id));
    }

    #[test]
    fn request_without_payload_is_noop() {
        let req: Request =
            serde_json::from_value(json!({"request_id": "x", "unix_seconds": 1})).unwrap();
        assert!(req.is_noop());
        assert!(!req.send_ack);
    }

    #[test]
    fn two_payloads_are_rejected() {
        let err = serde_json::from_value::<Request>(json!({
            "request_id": "x",
            "unix_seconds": 1,
            "me_request": {},
            "unpair_request": {},
        }))
        .unwrap_err();
        assert!(err.to_string().contains("more than one payload"));
    }

    #[test]
    fn null_payload_fields_are_absent() {
        let req: Request = serde_json::from_value(json!({
            "request_id": "x",
            "unix_seconds": 1,
            "me_request": {},
            "sign_request": null,
        }))
        .unwrap();
        assert!(matches!(req.body, RequestBody::Me(_)));
    }

    #[test]
    fn ack_response_parses_as_ack_only() {
        let resp: Response =
            serde_json::from_value(json!({"request_id": "r1", "ack_response": {}})).unwrap();
        assert!(resp.is_ack_only());
        assert!(resp.body.is_none());
    }

    #[test]
    fn sign_response_error_is_exposed() {
        let resp: Response = serde_json::from_value(json!({
            "request_id": "r1",
            "sign_response": {"error": "rejected"},
            "approved_until": 1700000000,
        }))
        .unwrap();
        assert_eq!(resp.error(), Some("rejected"));
        assert_eq!(resp.approved_until, Some(1_700_000_000));
    }

    #[test]
    fn opaque_team_payloads_pass_through() {
        let payload = json!({"team": {"name": "ops"}});
        let req: Request = serde_json::from_value(json!({
            "request_id": "t",
            "unix_seconds": 5,
            "create_team_request": payload.clone(),
        }))
        .unwrap();
        assert_eq!(req.body, RequestBody::CreateTeam(payload.clone()));

        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["create_team_request"], payload);
    }

    #[test]
    fn git_sign_armor() {
        let resp = GitSignResponse {
            signature: Some(vec![1, 2, 3]),
            error: None,
        };
        let armored = resp.ascii_armor_signature().unwrap();
        assert!(armored.starts_with("-----BEGIN PGP SIGNATURE-----"));
        assert!(armored.ends_with("-----END PGP SIGNATURE-----"));

        assert!(GitSignResponse::default().ascii_armor_signature().is_err());
    }

    #[test]
    fn needs_approval_only_for_signing() {
        assert!(Request::new(sign_body()).unwrap().needs_approval());
        assert!(!Request::new(RequestBody::Me(MeRequest::default()))
            .unwrap()
            .needs_approval());
    }
}
