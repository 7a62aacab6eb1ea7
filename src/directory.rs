// Bundled in-memory directory handler. Serves the root DSE, a static entry
// set loaded from the configuration, and simple binds against a configured
// root DN. Write operations mutate the shared entry list.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::config::Config;
use crate::handler::{BindOutcome, LdapOperations, OpError, SearchChannel, SessionInfo};
use crate::proto::{
    AddRequest, Attribute, BindAuthentication, BindRequest, CompareRequest, Control, DelRequest,
    Filter, LdapResult, ModifyDnRequest, ModifyOperation, ModifyRequest, ResultCode, SearchEntry,
    SearchRequest, SearchScope, SubstringPart,
};

pub struct InMemoryDirectory {
    naming_contexts: Vec<String>,
    root_dn: Option<String>,
    root_password: Option<String>,
    entries: RwLock<Vec<SearchEntry>>,
}

impl InMemoryDirectory {
    pub fn from_config(config: &Config) -> Self {
        let entries = config
            .directory
            .entries
            .iter()
            .map(|e| SearchEntry {
                dn: e.dn.clone(),
                attributes: e
                    .attributes
                    .iter()
                    .map(|(name, values)| Attribute {
                        name: name.clone(),
                        values: values.iter().map(|v| v.clone().into_bytes()).collect(),
                    })
                    .collect(),
            })
            .collect();
        Self {
            naming_contexts: config.naming_contexts.clone(),
            root_dn: config.directory.root_dn.clone(),
            root_password: config.directory.root_password.clone(),
            entries: RwLock::new(entries),
        }
    }

    fn root_dse(&self) -> SearchEntry {
        SearchEntry {
            dn: String::new(),
            attributes: vec![
                Attribute {
                    name: "objectClass".into(),
                    values: vec![b"top".to_vec()],
                },
                Attribute {
                    name: "supportedLDAPVersion".into(),
                    values: vec![b"3".to_vec()],
                },
                Attribute {
                    name: "namingContexts".into(),
                    values: self
                        .naming_contexts
                        .iter()
                        .map(|c| c.clone().into_bytes())
                        .collect(),
                },
            ],
        }
    }

    fn is_root(&self, session: &SessionInfo) -> bool {
        match (&self.root_dn, &session.bind_dn) {
            (Some(root), Some(bound)) => normalize_dn(root) == normalize_dn(bound),
            _ => false,
        }
    }

    fn require_root(&self, session: &SessionInfo) -> Result<(), OpError> {
        if self.is_root(session) {
            Ok(())
        } else {
            Err(OpError::failed(
                ResultCode::InsufficientAccessRights,
                "write operations require the root DN",
            ))
        }
    }
}

fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

fn parent_dn(dn: &str) -> Option<&str> {
    dn.split_once(',').map(|(_, parent)| parent)
}

fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    let dn = normalize_dn(dn);
    let base = normalize_dn(base);
    match scope {
        SearchScope::BaseObject => dn == base,
        SearchScope::SingleLevel => parent_dn(&dn) == Some(base.as_str()),
        SearchScope::WholeSubtree => {
            base.is_empty() || dn == base || dn.ends_with(&format!(",{}", base))
        }
    }
}

fn attr_values<'a>(entry: &'a SearchEntry, name: &str) -> Option<&'a Attribute> {
    entry
        .attributes
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case(name))
}

fn value_matches(candidate: &[u8], assertion: &[u8]) -> bool {
    match (std::str::from_utf8(candidate), std::str::from_utf8(assertion)) {
        (Ok(c), Ok(a)) => c.eq_ignore_ascii_case(a),
        _ => candidate == assertion,
    }
}

fn substring_match(value: &str, parts: &[SubstringPart]) -> bool {
    let value = value.to_ascii_lowercase();
    let mut pos = 0;
    for part in parts {
        match part {
            SubstringPart::Initial(p) => {
                let p = String::from_utf8_lossy(p).to_ascii_lowercase();
                if !value.starts_with(&p) {
                    return false;
                }
                pos = p.len();
            }
            SubstringPart::Any(p) => {
                let p = String::from_utf8_lossy(p).to_ascii_lowercase();
                match value[pos..].find(&p) {
                    Some(idx) => pos += idx + p.len(),
                    None => return false,
                }
            }
            SubstringPart::Final(p) => {
                let p = String::from_utf8_lossy(p).to_ascii_lowercase();
                if value.len() < pos + p.len() || !value.ends_with(&p) {
                    return false;
                }
            }
        }
    }
    true
}

fn matches_filter(entry: &SearchEntry, filter: &Filter) -> bool {
    match filter {
        Filter::And(fs) => fs.iter().all(|f| matches_filter(entry, f)),
        Filter::Or(fs) => fs.iter().any(|f| matches_filter(entry, f)),
        Filter::Not(f) => !matches_filter(entry, f),
        Filter::Present(attr) => attr_values(entry, attr).is_some(),
        Filter::Equality { attribute, value } | Filter::Approx { attribute, value } => {
            attr_values(entry, attribute)
                .map(|a| a.values.iter().any(|v| value_matches(v, value)))
                .unwrap_or(false)
        }
        Filter::Substrings { attribute, parts } => attr_values(entry, attribute)
            .map(|a| {
                a.values
                    .iter()
                    .any(|v| substring_match(&String::from_utf8_lossy(v), parts))
            })
            .unwrap_or(false),
        Filter::GreaterOrEqual { attribute, value } => attr_values(entry, attribute)
            .map(|a| a.values.iter().any(|v| v.as_slice() >= value.as_slice()))
            .unwrap_or(false),
        Filter::LessOrEqual { attribute, value } => attr_values(entry, attribute)
            .map(|a| a.values.iter().any(|v| v.as_slice() <= value.as_slice()))
            .unwrap_or(false),
        Filter::Extensible { .. } => false,
    }
}

/// Trim an entry to the requested attribute selection; empty selection or
/// "*" means every attribute. typesOnly strips the values.
fn project(entry: &SearchEntry, attributes: &[String], types_only: bool) -> SearchEntry {
    let keep_all = attributes.is_empty() || attributes.iter().any(|a| a == "*");
    let attributes = entry
        .attributes
        .iter()
        .filter(|a| keep_all || attributes.iter().any(|want| want.eq_ignore_ascii_case(&a.name)))
        .map(|a| Attribute {
            name: a.name.clone(),
            values: if types_only { vec![] } else { a.values.clone() },
        })
        .collect();
    SearchEntry {
        dn: entry.dn.clone(),
        attributes,
    }
}

#[async_trait]
impl LdapOperations for InMemoryDirectory {
    async fn bind(
        &self,
        _session: &SessionInfo,
        request: &BindRequest,
        _controls: &[Control],
    ) -> Result<BindOutcome, OpError> {
        let password = match &request.authentication {
            BindAuthentication::Simple(password) => password,
            BindAuthentication::Sasl { mechanism, .. } => {
                return Err(OpError::failed(
                    ResultCode::AuthMethodNotSupported,
                    format!("SASL mechanism {} not supported", mechanism),
                ));
            }
        };
        if request.name.is_empty() && password.is_empty() {
            return Ok(BindOutcome {
                dn: String::new(),
                version: request.version,
            });
        }
        match (&self.root_dn, &self.root_password) {
            (Some(root), Some(secret))
                if normalize_dn(root) == normalize_dn(&request.name) && secret == password =>
            {
                Ok(BindOutcome {
                    dn: request.name.clone(),
                    version: request.version,
                })
            }
            _ => Err(OpError::failed(
                ResultCode::InvalidCredentials,
                "invalid credentials",
            )),
        }
    }

    async fn search(
        &self,
        _session: &SessionInfo,
        request: &SearchRequest,
        _controls: &[Control],
        chan: &SearchChannel<'_>,
    ) -> Result<LdapResult, OpError> {
        if request.base_object.is_empty() && request.scope == SearchScope::BaseObject {
            let dse = self.root_dse();
            if matches_filter(&dse, &request.filter) {
                chan.entry(&project(&dse, &request.attributes, request.types_only))
                    .await?;
            }
            return Ok(LdapResult::success());
        }

        let snapshot = self.entries.read().expect("directory poisoned").clone();
        if !request.base_object.is_empty() {
            let base = normalize_dn(&request.base_object);
            if !snapshot.iter().any(|e| normalize_dn(&e.dn) == base) {
                return Ok(LdapResult::new(ResultCode::NoSuchObject, ""));
            }
        }

        let mut sent = 0usize;
        for entry in &snapshot {
            if !in_scope(&entry.dn, &request.base_object, request.scope)
                || !matches_filter(entry, &request.filter)
            {
                continue;
            }
            if request.size_limit > 0 && sent >= request.size_limit as usize {
                return Ok(LdapResult::new(ResultCode::SizeLimitExceeded, ""));
            }
            chan.entry(&project(entry, &request.attributes, request.types_only))
                .await?;
            sent += 1;
        }
        Ok(LdapResult::success())
    }

    async fn modify(
        &self,
        session: &SessionInfo,
        request: &ModifyRequest,
        _controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        self.require_root(session)?;
        let mut entries = self.entries.write().expect("directory poisoned");
        let target = normalize_dn(&request.object);
        let entry = match entries.iter_mut().find(|e| normalize_dn(&e.dn) == target) {
            Some(entry) => entry,
            None => return Ok(LdapResult::new(ResultCode::NoSuchObject, "")),
        };
        for change in &request.changes {
            let name = &change.modification.name;
            let values = &change.modification.values;
            match change.operation {
                ModifyOperation::Add => {
                    match entry
                        .attributes
                        .iter_mut()
                        .find(|a| a.name.eq_ignore_ascii_case(name))
                    {
                        Some(attr) => attr.values.extend(values.iter().cloned()),
                        None => entry.attributes.push(change.modification.clone()),
                    }
                }
                ModifyOperation::Delete => {
                    let had = entry
                        .attributes
                        .iter()
                        .any(|a| a.name.eq_ignore_ascii_case(name));
                    if !had {
                        return Ok(LdapResult::new(ResultCode::NoSuchAttribute, name.clone()));
                    }
                    if values.is_empty() {
                        entry.attributes.retain(|a| !a.name.eq_ignore_ascii_case(name));
                    } else {
                        for attr in &mut entry.attributes {
                            if attr.name.eq_ignore_ascii_case(name) {
                                attr.values.retain(|v| !values.contains(v));
                            }
                        }
                        entry.attributes.retain(|a| !a.values.is_empty());
                    }
                }
                ModifyOperation::Replace => {
                    entry.attributes.retain(|a| !a.name.eq_ignore_ascii_case(name));
                    if !values.is_empty() {
                        entry.attributes.push(change.modification.clone());
                    }
                }
            }
        }
        Ok(LdapResult::success())
    }

    async fn add(
        &self,
        session: &SessionInfo,
        request: &AddRequest,
        _controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        self.require_root(session)?;
        let mut entries = self.entries.write().expect("directory poisoned");
        let dn = normalize_dn(&request.entry);
        if entries.iter().any(|e| normalize_dn(&e.dn) == dn) {
            return Ok(LdapResult::new(ResultCode::EntryAlreadyExists, ""));
        }
        entries.push(SearchEntry {
            dn: request.entry.clone(),
            attributes: request.attributes.clone(),
        });
        Ok(LdapResult::success())
    }

    async fn delete(
        &self,
        session: &SessionInfo,
        request: &DelRequest,
        _controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        self.require_root(session)?;
        let mut entries = self.entries.write().expect("directory poisoned");
        let dn = normalize_dn(&request.entry);
        let child_suffix = format!(",{}", dn);
        if entries.iter().any(|e| normalize_dn(&e.dn).ends_with(&child_suffix)) {
            return Ok(LdapResult::new(
                ResultCode::UnwillingToPerform,
                "entry has children",
            ));
        }
        let before = entries.len();
        entries.retain(|e| normalize_dn(&e.dn) != dn);
        if entries.len() == before {
            return Ok(LdapResult::new(ResultCode::NoSuchObject, ""));
        }
        Ok(LdapResult::success())
    }

    async fn modify_dn(
        &self,
        session: &SessionInfo,
        request: &ModifyDnRequest,
        _controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        self.require_root(session)?;
        let mut entries = self.entries.write().expect("directory poisoned");
        let old = normalize_dn(&request.entry);
        let parent = match &request.new_superior {
            Some(superior) => Some(superior.as_str()),
            None => parent_dn(&request.entry),
        };
        let new_dn = match parent {
            Some(parent) => format!("{},{}", request.new_rdn, parent),
            None => request.new_rdn.clone(),
        };
        let new_normalized = normalize_dn(&new_dn);
        if new_normalized != old
            && entries.iter().any(|e| normalize_dn(&e.dn) == new_normalized)
        {
            return Ok(LdapResult::new(ResultCode::EntryAlreadyExists, ""));
        }
        let entry = match entries.iter_mut().find(|e| normalize_dn(&e.dn) == old) {
            Some(entry) => entry,
            None => return Ok(LdapResult::new(ResultCode::NoSuchObject, "")),
        };
        let old_rdn = entry.dn.split(',').next().unwrap_or("").to_string();
        entry.dn = new_dn;
        if request.delete_old_rdn {
            if let Some((name, value)) = old_rdn.split_once('=') {
                let name = name.trim().to_string();
                let value = value.trim().as_bytes().to_vec();
                for attr in &mut entry.attributes {
                    if attr.name.eq_ignore_ascii_case(&name) {
                        attr.values.retain(|v| !value_matches(v, &value));
                    }
                }
                entry.attributes.retain(|a| !a.values.is_empty());
            }
        }
        Ok(LdapResult::success())
    }

    async fn compare(
        &self,
        _session: &SessionInfo,
        request: &CompareRequest,
        _controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        let entries = self.entries.read().expect("directory poisoned");
        let dn = normalize_dn(&request.entry);
        let entry = match entries.iter().find(|e| normalize_dn(&e.dn) == dn) {
            Some(entry) => entry,
            None => return Ok(LdapResult::new(ResultCode::NoSuchObject, "")),
        };
        let matched = attr_values(entry, &request.attribute)
            .map(|a| a.values.iter().any(|v| value_matches(v, &request.value)))
            .unwrap_or(false);
        Ok(LdapResult::new(
            if matched {
                ResultCode::CompareTrue
            } else {
                ResultCode::CompareFalse
            },
            "",
        ))
    }
}
