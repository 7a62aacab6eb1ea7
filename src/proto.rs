// LDAPv3 message grammar (RFC 4511) on top of the BER codec: envelope
// parsing, typed request ops, filters, controls, and response encoding.

use crate::ber::{self, BerValue, TagClass, Tagged, TaggedContent};
use thiserror::Error;

pub const TAG_BIND_REQUEST: u32 = 0;
pub const TAG_BIND_RESPONSE: u32 = 1;
pub const TAG_UNBIND_REQUEST: u32 = 2;
pub const TAG_SEARCH_REQUEST: u32 = 3;
pub const TAG_SEARCH_RESULT_ENTRY: u32 = 4;
pub const TAG_SEARCH_RESULT_DONE: u32 = 5;
pub const TAG_MODIFY_REQUEST: u32 = 6;
pub const TAG_MODIFY_RESPONSE: u32 = 7;
pub const TAG_ADD_REQUEST: u32 = 8;
pub const TAG_ADD_RESPONSE: u32 = 9;
pub const TAG_DEL_REQUEST: u32 = 10;
pub const TAG_DEL_RESPONSE: u32 = 11;
pub const TAG_MODIFY_DN_REQUEST: u32 = 12;
pub const TAG_MODIFY_DN_RESPONSE: u32 = 13;
pub const TAG_COMPARE_REQUEST: u32 = 14;
pub const TAG_COMPARE_RESPONSE: u32 = 15;
pub const TAG_ABANDON_REQUEST: u32 = 16;
pub const TAG_EXTENDED_RESPONSE: u32 = 24;

/// Notice of Disconnection responseName (RFC 4511 §4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed BER: {0}")]
    Ber(#[from] ber::DecodeError),
    #[error("{0}")]
    Envelope(&'static str),
    #[error("message ID 0 is reserved for unsolicited notifications")]
    ReservedMessageId,
    #[error("message ID {0} out of range")]
    MessageIdRange(i64),
    #[error("unsupported protocol op tag {0}")]
    UnsupportedTag(u32),
    #[error("malformed request: expected {0}")]
    Expected(&'static str),
    #[error("unrecognized filter tag {0}")]
    Filter(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    NoSuchAttribute = 16,
    NoSuchObject = 32,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    UnwillingToPerform = 53,
    EntryAlreadyExists = 68,
    Other = 80,
}

/// Terminal status of an operation: resultCode, matchedDN, diagnosticMessage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }

    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub criticality: bool,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_id: i32,
    pub request: Request,
    pub controls: Vec<Control>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Bind(BindRequest),
    Unbind,
    Search(SearchRequest),
    Modify(ModifyRequest),
    Add(AddRequest),
    Del(DelRequest),
    ModifyDn(ModifyDnRequest),
    Compare(CompareRequest),
    Abandon(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(ProtocolError::Expected("search scope 0..=2")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

/// RFC 4511 Filter CHOICE: [0]=and, [1]=or, [2]=not, [3]=equalityMatch,
/// [4]=substrings, [5]=greaterOrEqual, [6]=lessOrEqual, [7]=present,
/// [8]=approxMatch, [9]=extensibleMatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: Vec<u8> },
    Substrings { attribute: String, parts: Vec<SubstringPart> },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Present(String),
    Approx { attribute: String, value: Vec<u8> },
    Extensible {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubstringPart {
    Initial(Vec<u8>),
    Any(Vec<u8>),
    Final(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareRequest {
    pub entry: String,
    pub attribute: String,
    pub value: Vec<u8>,
}

/// One SearchResultEntry as the handler hands it back.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl Envelope {
    /// Parse one LDAPMessage frame: SEQUENCE { messageID, protocolOp
    /// (APPLICATION-tagged), controls [0] OPTIONAL }.
    pub fn decode(frame: &[u8]) -> Result<Envelope, ProtocolError> {
        let root = ber::decode(frame)?;
        let items = root
            .as_sequence()
            .ok_or(ProtocolError::Envelope("LDAPMessage is not a SEQUENCE"))?;
        if items.len() < 2 || items.len() > 3 {
            return Err(ProtocolError::Envelope("LDAPMessage has wrong arity"));
        }
        let id = match items[0] {
            BerValue::Integer(v) => v,
            _ => return Err(ProtocolError::Envelope("messageID is not an INTEGER")),
        };
        if !(0..=i32::MAX as i64).contains(&id) {
            return Err(ProtocolError::MessageIdRange(id));
        }
        if id == 0 {
            return Err(ProtocolError::ReservedMessageId);
        }
        let op = match &items[1] {
            BerValue::Tagged(t) if t.class == TagClass::Application => t,
            _ => return Err(ProtocolError::Envelope("protocolOp is not APPLICATION-tagged")),
        };
        let controls = match items.get(2) {
            None => Vec::new(),
            Some(BerValue::Tagged(t)) if t.class == TagClass::Context && t.number == 0 => {
                parse_controls(t)?
            }
            Some(_) => return Err(ProtocolError::Envelope("controls must be [0]-tagged")),
        };
        Ok(Envelope {
            message_id: id as i32,
            request: Request::from_op(op)?,
            controls,
        })
    }
}

impl Request {
    fn from_op(op: &Tagged) -> Result<Request, ProtocolError> {
        match op.number {
            TAG_BIND_REQUEST => Ok(Request::Bind(parse_bind(constructed(op, "bind request")?)?)),
            TAG_UNBIND_REQUEST => Ok(Request::Unbind),
            TAG_SEARCH_REQUEST => {
                Ok(Request::Search(parse_search(constructed(op, "search request")?)?))
            }
            TAG_MODIFY_REQUEST => {
                Ok(Request::Modify(parse_modify(constructed(op, "modify request")?)?))
            }
            TAG_ADD_REQUEST => Ok(Request::Add(parse_add(constructed(op, "add request")?)?)),
            TAG_DEL_REQUEST => {
                // [APPLICATION 10] is IMPLICIT LDAPDN: content is the DN itself.
                let dn = primitive(op, "del request DN")?;
                Ok(Request::Del(DelRequest {
                    entry: utf8(dn, "del request DN")?,
                }))
            }
            TAG_MODIFY_DN_REQUEST => Ok(Request::ModifyDn(parse_modify_dn(constructed(
                op,
                "modify DN request",
            )?)?)),
            TAG_COMPARE_REQUEST => {
                Ok(Request::Compare(parse_compare(constructed(op, "compare request")?)?))
            }
            TAG_ABANDON_REQUEST => {
                // [APPLICATION 16] is IMPLICIT MessageID: content is the integer.
                let content = primitive(op, "abandon message ID")?;
                let target = ber::integer_from_bytes(content)
                    .map_err(|_| ProtocolError::Expected("abandon message ID"))?;
                if !(0..=i32::MAX as i64).contains(&target) {
                    return Err(ProtocolError::MessageIdRange(target));
                }
                Ok(Request::Abandon(target as i32))
            }
            other => Err(ProtocolError::UnsupportedTag(other)),
        }
    }

    /// APPLICATION tag of the terminal response for this request, or None
    /// when the operation produces no response (Unbind, Abandon).
    pub fn response_tag(&self) -> Option<u32> {
        match self {
            Request::Bind(_) => Some(TAG_BIND_RESPONSE),
            Request::Search(_) => Some(TAG_SEARCH_RESULT_DONE),
            Request::Modify(_) => Some(TAG_MODIFY_RESPONSE),
            Request::Add(_) => Some(TAG_ADD_RESPONSE),
            Request::Del(_) => Some(TAG_DEL_RESPONSE),
            Request::ModifyDn(_) => Some(TAG_MODIFY_DN_RESPONSE),
            Request::Compare(_) => Some(TAG_COMPARE_RESPONSE),
            Request::Unbind | Request::Abandon(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Bind(_) => "bind",
            Request::Unbind => "unbind",
            Request::Search(_) => "search",
            Request::Modify(_) => "modify",
            Request::Add(_) => "add",
            Request::Del(_) => "del",
            Request::ModifyDn(_) => "modifydn",
            Request::Compare(_) => "compare",
            Request::Abandon(_) => "abandon",
        }
    }
}

fn constructed<'a>(t: &'a Tagged, what: &'static str) -> Result<&'a [BerValue], ProtocolError> {
    match &t.content {
        TaggedContent::Constructed(items) => Ok(items),
        TaggedContent::Primitive(_) => Err(ProtocolError::Expected(what)),
    }
}

fn primitive<'a>(t: &'a Tagged, what: &'static str) -> Result<&'a [u8], ProtocolError> {
    match &t.content {
        TaggedContent::Primitive(bytes) => Ok(bytes),
        TaggedContent::Constructed(_) => Err(ProtocolError::Expected(what)),
    }
}

fn utf8(bytes: &[u8], what: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Expected(what))
}

fn string_of(v: &BerValue, what: &'static str) -> Result<String, ProtocolError> {
    v.as_str()
        .map(str::to_owned)
        .ok_or(ProtocolError::Expected(what))
}

fn bytes_of(v: &BerValue, what: &'static str) -> Result<Vec<u8>, ProtocolError> {
    v.as_bytes().map(<[u8]>::to_vec).ok_or(ProtocolError::Expected(what))
}

fn int_of(v: &BerValue, what: &'static str) -> Result<i64, ProtocolError> {
    v.as_i64().ok_or(ProtocolError::Expected(what))
}

fn bool_of(v: &BerValue, what: &'static str) -> Result<bool, ProtocolError> {
    v.as_bool().ok_or(ProtocolError::Expected(what))
}

fn parse_controls(t: &Tagged) -> Result<Vec<Control>, ProtocolError> {
    let items = constructed(t, "controls sequence")?;
    let mut controls = Vec::with_capacity(items.len());
    for item in items {
        let fields = item
            .as_sequence()
            .ok_or(ProtocolError::Expected("control SEQUENCE"))?;
        let mut fields = fields.iter();
        let oid = match fields.next() {
            Some(v) => string_of(v, "control OID")?,
            None => return Err(ProtocolError::Expected("control OID")),
        };
        let mut criticality = false;
        let mut value = None;
        for field in fields {
            match field {
                BerValue::Boolean(c) => criticality = *c,
                BerValue::OctetString(v) => value = Some(v.clone()),
                _ => return Err(ProtocolError::Expected("control field")),
            }
        }
        controls.push(Control {
            oid,
            criticality,
            value,
        });
    }
    Ok(controls)
}

fn parse_bind(items: &[BerValue]) -> Result<BindRequest, ProtocolError> {
    if items.len() != 3 {
        return Err(ProtocolError::Expected("bind request arity"));
    }
    let version = int_of(&items[0], "bind version")? as i32;
    let name = string_of(&items[1], "bind name")?;
    let auth = match &items[2] {
        BerValue::Tagged(t) if t.class == TagClass::Context && t.number == 0 => {
            let password = primitive(t, "simple credentials")?;
            BindAuthentication::Simple(utf8(password, "simple credentials")?)
        }
        BerValue::Tagged(t) if t.class == TagClass::Context && t.number == 3 => {
            let parts = constructed(t, "SASL credentials")?;
            let mechanism = match parts.first() {
                Some(v) => string_of(v, "SASL mechanism")?,
                None => return Err(ProtocolError::Expected("SASL mechanism")),
            };
            let credentials = match parts.get(1) {
                Some(v) => bytes_of(v, "SASL credentials")?,
                None => Vec::new(),
            };
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        _ => return Err(ProtocolError::Expected("bind authentication choice")),
    };
    Ok(BindRequest {
        version,
        name,
        authentication: auth,
    })
}

fn parse_search(items: &[BerValue]) -> Result<SearchRequest, ProtocolError> {
    if items.len() != 8 {
        return Err(ProtocolError::Expected("search request arity"));
    }
    let attributes = items[7]
        .as_sequence()
        .ok_or(ProtocolError::Expected("attribute selection"))?
        .iter()
        .map(|v| string_of(v, "attribute description"))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SearchRequest {
        base_object: string_of(&items[0], "search base")?,
        scope: SearchScope::try_from(int_of(&items[1], "search scope")?)?,
        deref_aliases: int_of(&items[2], "deref aliases")? as i32,
        size_limit: int_of(&items[3], "size limit")? as i32,
        time_limit: int_of(&items[4], "time limit")? as i32,
        types_only: bool_of(&items[5], "typesOnly")?,
        filter: Filter::parse(&items[6])?,
        attributes,
    })
}

impl Filter {
    pub fn parse(v: &BerValue) -> Result<Filter, ProtocolError> {
        let t = match v {
            BerValue::Tagged(t) if t.class == TagClass::Context => t,
            _ => return Err(ProtocolError::Expected("context-tagged filter")),
        };
        match t.number {
            0 | 1 => {
                let parts = constructed(t, "filter set")?
                    .iter()
                    .map(Filter::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                if parts.is_empty() {
                    return Err(ProtocolError::Expected("non-empty filter set"));
                }
                Ok(if t.number == 0 {
                    Filter::And(parts)
                } else {
                    Filter::Or(parts)
                })
            }
            2 => {
                let inner = constructed(t, "not filter")?;
                if inner.len() != 1 {
                    return Err(ProtocolError::Expected("single filter under not"));
                }
                Ok(Filter::Not(Box::new(Filter::parse(&inner[0])?)))
            }
            3 => ava(t).map(|(attribute, value)| Filter::Equality { attribute, value }),
            4 => {
                let items = constructed(t, "substring filter")?;
                if items.len() != 2 {
                    return Err(ProtocolError::Expected("substring filter arity"));
                }
                let attribute = string_of(&items[0], "substring attribute")?;
                let mut parts = Vec::new();
                for sub in items[1]
                    .as_sequence()
                    .ok_or(ProtocolError::Expected("substring sequence"))?
                {
                    let st = match sub {
                        BerValue::Tagged(st) if st.class == TagClass::Context => st,
                        _ => return Err(ProtocolError::Expected("substring choice")),
                    };
                    let value = primitive(st, "substring value")?.to_vec();
                    parts.push(match st.number {
                        0 => SubstringPart::Initial(value),
                        1 => SubstringPart::Any(value),
                        2 => SubstringPart::Final(value),
                        _ => return Err(ProtocolError::Expected("substring choice")),
                    });
                }
                Ok(Filter::Substrings { attribute, parts })
            }
            5 => ava(t).map(|(attribute, value)| Filter::GreaterOrEqual { attribute, value }),
            6 => ava(t).map(|(attribute, value)| Filter::LessOrEqual { attribute, value }),
            7 => {
                let attr = primitive(t, "present attribute")?;
                Ok(Filter::Present(utf8(attr, "present attribute")?))
            }
            8 => ava(t).map(|(attribute, value)| Filter::Approx { attribute, value }),
            9 => {
                let mut matching_rule = None;
                let mut attribute = None;
                let mut value = Vec::new();
                let mut dn_attributes = false;
                for item in constructed(t, "matching rule assertion")? {
                    let it = match item {
                        BerValue::Tagged(it) if it.class == TagClass::Context => it,
                        _ => return Err(ProtocolError::Expected("matching rule field")),
                    };
                    let content = primitive(it, "matching rule field")?;
                    match it.number {
                        1 => matching_rule = Some(utf8(content, "matching rule OID")?),
                        2 => attribute = Some(utf8(content, "matching rule type")?),
                        3 => value = content.to_vec(),
                        4 => dn_attributes = content.first().copied().unwrap_or(0) != 0,
                        _ => return Err(ProtocolError::Expected("matching rule field")),
                    }
                }
                Ok(Filter::Extensible {
                    matching_rule,
                    attribute,
                    value,
                    dn_attributes,
                })
            }
            other => Err(ProtocolError::Filter(other)),
        }
    }

    /// RFC 4515 string form, e.g. "(cn=admin)" or "(&(a=b)(c=d))".
    pub fn to_filter_string(&self) -> String {
        match self {
            Filter::And(fs) => format!(
                "(&{})",
                fs.iter().map(Filter::to_filter_string).collect::<String>()
            ),
            Filter::Or(fs) => format!(
                "(|{})",
                fs.iter().map(Filter::to_filter_string).collect::<String>()
            ),
            Filter::Not(f) => format!("(!{})", f.to_filter_string()),
            Filter::Equality { attribute, value } => {
                format!("({}={})", attribute, escape_value(value))
            }
            Filter::Substrings { attribute, parts } => {
                let mut s = format!("({}=", attribute);
                let mut last_was_value = false;
                for part in parts {
                    match part {
                        SubstringPart::Initial(v) => {
                            s.push_str(&escape_value(v));
                        }
                        SubstringPart::Any(v) | SubstringPart::Final(v) => {
                            s.push('*');
                            s.push_str(&escape_value(v));
                        }
                    }
                    last_was_value = !matches!(part, SubstringPart::Final(_));
                }
                if last_was_value {
                    s.push('*');
                }
                s.push(')');
                s
            }
            Filter::GreaterOrEqual { attribute, value } => {
                format!("({}>={})", attribute, escape_value(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                format!("({}<={})", attribute, escape_value(value))
            }
            Filter::Present(attribute) => format!("({}=*)", attribute),
            Filter::Approx { attribute, value } => {
                format!("({}~={})", attribute, escape_value(value))
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                let mut s = String::from("(");
                if let Some(attr) = attribute {
                    s.push_str(attr);
                }
                if *dn_attributes {
                    s.push_str(":dn");
                }
                if let Some(rule) = matching_rule {
                    s.push(':');
                    s.push_str(rule);
                }
                s.push_str(":=");
                s.push_str(&escape_value(value));
                s.push(')');
                s
            }
        }
    }
}

/// Escape an assertion value per RFC 4515: NUL, parens, asterisk, backslash.
fn escape_value(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value {
        match b {
            0x00 => out.push_str("\\00"),
            b'(' => out.push_str("\\28"),
            b')' => out.push_str("\\29"),
            b'*' => out.push_str("\\2a"),
            b'\\' => out.push_str("\\5c"),
            _ if b.is_ascii_graphic() || b == b' ' => out.push(b as char),
            _ => out.push_str(&format!("\\{:02x}", b)),
        }
    }
    out
}

/// AttributeValueAssertion carried IMPLICIT in a filter choice: the two
/// fields sit directly under the context tag.
fn ava(t: &Tagged) -> Result<(String, Vec<u8>), ProtocolError> {
    let items = constructed(t, "attribute value assertion")?;
    if items.len() != 2 {
        return Err(ProtocolError::Expected("attribute value assertion arity"));
    }
    Ok((
        string_of(&items[0], "attribute description")?,
        bytes_of(&items[1], "assertion value")?,
    ))
}

fn parse_attribute(v: &BerValue, what: &'static str) -> Result<Attribute, ProtocolError> {
    let fields = v.as_sequence().ok_or(ProtocolError::Expected(what))?;
    if fields.len() != 2 {
        return Err(ProtocolError::Expected(what));
    }
    let name = string_of(&fields[0], what)?;
    // Values are SET OF per RFC; tolerate SEQUENCE from lax encoders.
    let values = match &fields[1] {
        BerValue::Set(items) | BerValue::Sequence(items) => items
            .iter()
            .map(|v| bytes_of(v, what))
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(ProtocolError::Expected(what)),
    };
    Ok(Attribute { name, values })
}

fn parse_modify(items: &[BerValue]) -> Result<ModifyRequest, ProtocolError> {
    if items.len() != 2 {
        return Err(ProtocolError::Expected("modify request arity"));
    }
    let object = string_of(&items[0], "modify object DN")?;
    let mut changes = Vec::new();
    for change in items[1]
        .as_sequence()
        .ok_or(ProtocolError::Expected("modify change list"))?
    {
        let fields = change
            .as_sequence()
            .ok_or(ProtocolError::Expected("modify change"))?;
        if fields.len() != 2 {
            return Err(ProtocolError::Expected("modify change arity"));
        }
        let operation = match int_of(&fields[0], "modify operation")? {
            0 => ModifyOperation::Add,
            1 => ModifyOperation::Delete,
            2 => ModifyOperation::Replace,
            _ => return Err(ProtocolError::Expected("modify operation 0..=2")),
        };
        changes.push(ModifyChange {
            operation,
            modification: parse_attribute(&fields[1], "partial attribute")?,
        });
    }
    Ok(ModifyRequest { object, changes })
}

fn parse_add(items: &[BerValue]) -> Result<AddRequest, ProtocolError> {
    if items.len() != 2 {
        return Err(ProtocolError::Expected("add request arity"));
    }
    let entry = string_of(&items[0], "add entry DN")?;
    let attributes = items[1]
        .as_sequence()
        .ok_or(ProtocolError::Expected("add attribute list"))?
        .iter()
        .map(|v| parse_attribute(v, "add attribute"))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AddRequest { entry, attributes })
}

fn parse_modify_dn(items: &[BerValue]) -> Result<ModifyDnRequest, ProtocolError> {
    if items.len() < 3 || items.len() > 4 {
        return Err(ProtocolError::Expected("modify DN request arity"));
    }
    let new_superior = match items.get(3) {
        None => None,
        Some(BerValue::Tagged(t)) if t.class == TagClass::Context && t.number == 0 => {
            Some(utf8(primitive(t, "newSuperior")?, "newSuperior")?)
        }
        Some(_) => return Err(ProtocolError::Expected("newSuperior [0]")),
    };
    Ok(ModifyDnRequest {
        entry: string_of(&items[0], "modify DN entry")?,
        new_rdn: string_of(&items[1], "new RDN")?,
        delete_old_rdn: bool_of(&items[2], "deleteoldrdn")?,
        new_superior,
    })
}

fn parse_compare(items: &[BerValue]) -> Result<CompareRequest, ProtocolError> {
    if items.len() != 2 {
        return Err(ProtocolError::Expected("compare request arity"));
    }
    let entry = string_of(&items[0], "compare entry DN")?;
    let ava = items[1]
        .as_sequence()
        .ok_or(ProtocolError::Expected("compare assertion"))?;
    if ava.len() != 2 {
        return Err(ProtocolError::Expected("compare assertion arity"));
    }
    Ok(CompareRequest {
        entry,
        attribute: string_of(&ava[0], "compare attribute")?,
        value: bytes_of(&ava[1], "compare value")?,
    })
}

fn application(number: u32, items: Vec<BerValue>) -> BerValue {
    BerValue::Tagged(Tagged {
        class: TagClass::Application,
        number,
        content: TaggedContent::Constructed(items),
    })
}

fn envelope_frame(message_id: i32, op: BerValue) -> Vec<u8> {
    ber::encode(&BerValue::Sequence(vec![
        BerValue::Integer(message_id as i64),
        op,
    ]))
}

fn result_fields(result: &LdapResult) -> Vec<BerValue> {
    vec![
        BerValue::Enumerated(result.code as i64),
        BerValue::OctetString(result.matched_dn.clone().into_bytes()),
        BerValue::OctetString(result.message.clone().into_bytes()),
    ]
}

/// Encode the terminal response PDU for an operation.
pub fn terminal_response(response_tag: u32, message_id: i32, result: &LdapResult) -> Vec<u8> {
    envelope_frame(message_id, application(response_tag, result_fields(result)))
}

pub fn search_entry_pdu(message_id: i32, entry: &SearchEntry) -> Vec<u8> {
    let attributes = entry
        .attributes
        .iter()
        .map(|a| {
            BerValue::Sequence(vec![
                BerValue::OctetString(a.name.clone().into_bytes()),
                BerValue::Set(a.values.iter().cloned().map(BerValue::OctetString).collect()),
            ])
        })
        .collect();
    envelope_frame(
        message_id,
        application(
            TAG_SEARCH_RESULT_ENTRY,
            vec![
                BerValue::OctetString(entry.dn.clone().into_bytes()),
                BerValue::Sequence(attributes),
            ],
        ),
    )
}

/// Unsolicited Notice of Disconnection: messageID 0, ExtendedResponse with
/// responseName 1.3.6.1.4.1.1466.20036. The LDAPOID is the dotted string.
pub fn notice_of_disconnection(code: ResultCode, message: &str) -> Vec<u8> {
    let mut fields = result_fields(&LdapResult::new(code, message));
    fields.push(BerValue::Tagged(Tagged {
        class: TagClass::Context,
        number: 10,
        content: TaggedContent::Primitive(NOTICE_OF_DISCONNECTION_OID.as_bytes().to_vec()),
    }));
    envelope_frame(0, application(TAG_EXTENDED_RESPONSE, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_prim(number: u32, content: &[u8]) -> BerValue {
        BerValue::Tagged(Tagged {
            class: TagClass::Context,
            number,
            content: TaggedContent::Primitive(content.to_vec()),
        })
    }

    fn ctx_cons(number: u32, items: Vec<BerValue>) -> BerValue {
        BerValue::Tagged(Tagged {
            class: TagClass::Context,
            number,
            content: TaggedContent::Constructed(items),
        })
    }

    fn octets(s: &str) -> BerValue {
        BerValue::OctetString(s.as_bytes().to_vec())
    }

    fn request_frame(message_id: i32, number: u32, items: Vec<BerValue>) -> Vec<u8> {
        ber::encode(&BerValue::Sequence(vec![
            BerValue::Integer(message_id as i64),
            application(number, items),
        ]))
    }

    fn search_items(filter: BerValue) -> Vec<BerValue> {
        vec![
            octets("dc=example,dc=com"),
            BerValue::Enumerated(2),
            BerValue::Enumerated(0),
            BerValue::Integer(0),
            BerValue::Integer(0),
            BerValue::Boolean(false),
            filter,
            BerValue::Sequence(vec![octets("cn"), octets("mail")]),
        ]
    }

    /// Hand-assembled BindRequest: SEQUENCE { 1, [APPLICATION 0] { version 3,
    /// name "cn=admin,dc=example,dc=com", simple [0] "secret" } }.
    #[test]
    fn test_parse_simple_bind_raw_bytes() {
        let msg = vec![
            0x30, 0x2c, 0x02, 0x01, 0x01, 0x60, 0x27, 0x02, 0x01, 0x03, 0x04, 0x1a, 0x63, 0x6e,
            0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d, 0x65, 0x78, 0x61, 0x6d,
            0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d, 0x80, 0x06, 0x73, 0x65,
            0x63, 0x72, 0x65, 0x74,
        ];
        let envelope = Envelope::decode(&msg).unwrap();
        assert_eq!(envelope.message_id, 1);
        assert!(envelope.controls.is_empty());
        match envelope.request {
            Request::Bind(bind) => {
                assert_eq!(bind.version, 3);
                assert_eq!(bind.name, "cn=admin,dc=example,dc=com");
                assert_eq!(
                    bind.authentication,
                    BindAuthentication::Simple("secret".into())
                );
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_sasl_bind() {
        let frame = request_frame(
            1,
            TAG_BIND_REQUEST,
            vec![
                BerValue::Integer(3),
                octets(""),
                ctx_cons(3, vec![octets("EXTERNAL")]),
            ],
        );
        let envelope = Envelope::decode(&frame).unwrap();
        match envelope.request {
            Request::Bind(bind) => match bind.authentication {
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                } => {
                    assert_eq!(mechanism, "EXTERNAL");
                    assert!(credentials.is_empty());
                }
                other => panic!("unexpected authentication: {:?}", other),
            },
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_with_present_filter() {
        let frame = request_frame(
            2,
            TAG_SEARCH_REQUEST,
            search_items(ctx_prim(7, b"objectClass")),
        );
        let envelope = Envelope::decode(&frame).unwrap();
        match envelope.request {
            Request::Search(search) => {
                assert_eq!(search.base_object, "dc=example,dc=com");
                assert_eq!(search.scope, SearchScope::WholeSubtree);
                assert!(!search.types_only);
                assert_eq!(search.filter, Filter::Present("objectClass".into()));
                assert_eq!(search.attributes, vec!["cn", "mail"]);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_with_compound_filter() {
        let filter = ctx_cons(
            0,
            vec![
                ctx_cons(3, vec![octets("uid"), octets("jdoe")]),
                ctx_cons(2, vec![ctx_prim(7, b"locked")]),
            ],
        );
        let frame = request_frame(3, TAG_SEARCH_REQUEST, search_items(filter));
        let envelope = Envelope::decode(&frame).unwrap();
        match envelope.request {
            Request::Search(search) => {
                assert_eq!(search.filter.to_filter_string(), "(&(uid=jdoe)(!(locked=*)))");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_substrings_filter() {
        let filter = ctx_cons(
            4,
            vec![
                octets("cn"),
                BerValue::Sequence(vec![ctx_prim(0, b"ad"), ctx_prim(1, b"mi")]),
            ],
        );
        let frame = request_frame(4, TAG_SEARCH_REQUEST, search_items(filter));
        let envelope = Envelope::decode(&frame).unwrap();
        match envelope.request {
            Request::Search(search) => {
                assert_eq!(search.filter.to_filter_string(), "(cn=ad*mi*)");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_filter_string_escaping() {
        let filter = Filter::Equality {
            attribute: "cn".into(),
            value: b"a*b(c)d\\e".to_vec(),
        };
        assert_eq!(filter.to_filter_string(), "(cn=a\\2ab\\28c\\29d\\5ce)");
    }

    #[test]
    fn test_parse_modify_request() {
        let change = BerValue::Sequence(vec![
            BerValue::Enumerated(2),
            BerValue::Sequence(vec![
                octets("mail"),
                BerValue::Set(vec![octets("new@example.com")]),
            ]),
        ]);
        let frame = request_frame(
            5,
            TAG_MODIFY_REQUEST,
            vec![
                octets("cn=jdoe,dc=example,dc=com"),
                BerValue::Sequence(vec![change]),
            ],
        );
        let envelope = Envelope::decode(&frame).unwrap();
        match envelope.request {
            Request::Modify(modify) => {
                assert_eq!(modify.object, "cn=jdoe,dc=example,dc=com");
                assert_eq!(modify.changes.len(), 1);
                assert_eq!(modify.changes[0].operation, ModifyOperation::Replace);
                assert_eq!(modify.changes[0].modification.name, "mail");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_del_and_abandon_are_implicit_primitives() {
        // DelRequest content is the bare DN, AbandonRequest the bare integer.
        let del = ber::encode(&BerValue::Sequence(vec![
            BerValue::Integer(6),
            BerValue::Tagged(Tagged {
                class: TagClass::Application,
                number: TAG_DEL_REQUEST,
                content: TaggedContent::Primitive(b"cn=old,dc=example,dc=com".to_vec()),
            }),
        ]));
        match Envelope::decode(&del).unwrap().request {
            Request::Del(del) => assert_eq!(del.entry, "cn=old,dc=example,dc=com"),
            other => panic!("unexpected request: {:?}", other),
        }

        let abandon = ber::encode(&BerValue::Sequence(vec![
            BerValue::Integer(7),
            BerValue::Tagged(Tagged {
                class: TagClass::Application,
                number: TAG_ABANDON_REQUEST,
                content: TaggedContent::Primitive(vec![0x05]),
            }),
        ]));
        match Envelope::decode(&abandon).unwrap().request {
            Request::Abandon(target) => assert_eq!(target, 5),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_modify_dn_with_new_superior() {
        let frame = request_frame(
            8,
            TAG_MODIFY_DN_REQUEST,
            vec![
                octets("cn=jdoe,ou=people,dc=example,dc=com"),
                octets("cn=jdoe"),
                BerValue::Boolean(true),
                ctx_prim(0, b"ou=staff,dc=example,dc=com"),
            ],
        );
        match Envelope::decode(&frame).unwrap().request {
            Request::ModifyDn(req) => {
                assert_eq!(req.new_rdn, "cn=jdoe");
                assert!(req.delete_old_rdn);
                assert_eq!(req.new_superior.as_deref(), Some("ou=staff,dc=example,dc=com"));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_controls() {
        let control = BerValue::Sequence(vec![
            octets("1.2.840.113556.1.4.319"),
            BerValue::Boolean(true),
            BerValue::OctetString(vec![0x30, 0x00]),
        ]);
        let frame = ber::encode(&BerValue::Sequence(vec![
            BerValue::Integer(9),
            application(TAG_UNBIND_REQUEST, vec![]),
            ctx_cons(0, vec![control]),
        ]));
        let envelope = Envelope::decode(&frame).unwrap();
        assert_eq!(envelope.controls.len(), 1);
        assert_eq!(envelope.controls[0].oid, "1.2.840.113556.1.4.319");
        assert!(envelope.controls[0].criticality);
        assert_eq!(envelope.controls[0].value.as_deref(), Some(&[0x30, 0x00][..]));
    }

    #[test]
    fn test_reject_message_id_zero() {
        let frame = request_frame(0, TAG_UNBIND_REQUEST, vec![]);
        match Envelope::decode(&frame) {
            Err(ProtocolError::ReservedMessageId) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_reject_non_application_protocol_op() {
        let frame = ber::encode(&BerValue::Sequence(vec![
            BerValue::Integer(1),
            BerValue::Sequence(vec![]),
        ]));
        match Envelope::decode(&frame) {
            Err(ProtocolError::Envelope(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_reject_unknown_application_tag() {
        let frame = request_frame(1, 23, vec![octets("1.3.6.1.4.1.1466.20037")]);
        match Envelope::decode(&frame) {
            Err(ProtocolError::UnsupportedTag(23)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_terminal_response_shape() {
        let frame = terminal_response(
            TAG_BIND_RESPONSE,
            7,
            &LdapResult::new(ResultCode::InvalidCredentials, "bad password"),
        );
        let value = ber::decode(&frame).unwrap();
        let items = value.as_sequence().unwrap();
        assert_eq!(items[0], BerValue::Integer(7));
        let op = items[1].as_tagged().unwrap();
        assert_eq!(op.class, TagClass::Application);
        assert_eq!(op.number, TAG_BIND_RESPONSE);
        match &op.content {
            TaggedContent::Constructed(fields) => {
                assert_eq!(fields[0], BerValue::Enumerated(49));
                assert_eq!(fields[2], octets("bad password"));
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_notice_of_disconnection_shape() {
        let frame = notice_of_disconnection(ResultCode::ProtocolError, "bad PDU");
        let value = ber::decode(&frame).unwrap();
        let items = value.as_sequence().unwrap();
        assert_eq!(items[0], BerValue::Integer(0));
        let op = items[1].as_tagged().unwrap();
        assert_eq!(op.number, TAG_EXTENDED_RESPONSE);
        match &op.content {
            TaggedContent::Constructed(fields) => {
                assert_eq!(fields[0], BerValue::Enumerated(2));
                let name = fields[3].as_tagged().unwrap();
                assert_eq!(name.class, TagClass::Context);
                assert_eq!(name.number, 10);
                assert_eq!(
                    name.content,
                    TaggedContent::Primitive(NOTICE_OF_DISCONNECTION_OID.as_bytes().to_vec())
                );
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_search_entry_pdu_roundtrip_shape() {
        let entry = SearchEntry {
            dn: "cn=hello,dc=example,dc=com".into(),
            attributes: vec![Attribute {
                name: "cn".into(),
                values: vec![b"hello".to_vec()],
            }],
        };
        let frame = search_entry_pdu(11, &entry);
        let value = ber::decode(&frame).unwrap();
        let items = value.as_sequence().unwrap();
        assert_eq!(items[0], BerValue::Integer(11));
        let op = items[1].as_tagged().unwrap();
        assert_eq!(op.number, TAG_SEARCH_RESULT_ENTRY);
    }
}
