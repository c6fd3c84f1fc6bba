//! Container ACL parsing and normalization.
//!
//! ACL values are comma-separated entries: `account`, `account:user`, or
//! referrer designators like `.r:*`, `.r:.example.com`, `.r:-blocked.host`,
//! plus `.rlistings` to open container listings. Referrer designators are
//! only legal in read ACLs.

/// Invalid ACL syntax; surfaces as a 400 from the container controller.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{0}")]
pub struct AclError(String);

const REFERRER_DESIGNATORS: &[&str] = &[".r", ".ref", ".referer", ".referrer"];

/// Validate and normalize an ACL header value. `name` is the header name
/// (`x-container-read` / `x-container-write`); write ACLs reject referrer
/// entries.
pub fn clean_acl(name: &str, value: &str) -> Result<String, AclError> {
    let is_write = name.to_ascii_lowercase().contains("write");
    let mut values: Vec<String> = Vec::new();
    for raw in value.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let Some((first, second)) = raw.split_once(':') else {
            values.push(raw.to_string());
            continue;
        };
        let (first, second) = (first.trim(), second.trim());
        if !first.starts_with('.') {
            values.push(raw.to_string());
            continue;
        }
        if !REFERRER_DESIGNATORS.contains(&first) {
            return Err(AclError(format!("Unknown designator {first:?} in ACL: {raw:?}")));
        }
        if is_write {
            return Err(AclError(format!("Referrers not allowed in write ACL: {raw:?}")));
        }
        let (negate, mut host) = match second.strip_prefix('-') {
            Some(rest) => (true, rest.trim()),
            None => (false, second),
        };
        // "*.example.com" normalizes to ".example.com"; bare "*" stays.
        if host != "*" {
            if let Some(rest) = host.strip_prefix('*') {
                host = rest.trim();
            }
        }
        if host.is_empty() || host == "." {
            return Err(AclError(format!(
                "No host/domain value after referrer designation in ACL: {raw:?}"
            )));
        }
        if negate {
            values.push(format!(".r:-{host}"));
        } else {
            values.push(format!(".r:{host}"));
        }
    }
    Ok(values.join(","))
}

/// Split a stored ACL value into referrer designators and group/user entries.
pub fn parse_acl(value: &str) -> (Vec<String>, Vec<String>) {
    let mut referrers = Vec::new();
    let mut groups = Vec::new();
    for raw in value.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match raw.strip_prefix(".r:") {
            Some(host) => referrers.push(host.to_string()),
            None => groups.push(raw.to_string()),
        }
    }
    (referrers, groups)
}

/// Whether a `Referer` header satisfies the referrer entries of a read ACL.
/// Later entries win, so `.r:*,.r:-bad.host` denies `bad.host`.
pub fn referrer_allowed(referrer: Option<&str>, referrer_acl: &[String]) -> bool {
    let host = referrer
        .and_then(|r| r.split("//").nth(1))
        .map(|rest| rest.split(['/', ':']).next().unwrap_or(""))
        .map(|h| h.to_ascii_lowercase())
        .unwrap_or_default();
    let mut allowed = false;
    for entry in referrer_acl {
        let (negate, pattern) = match entry.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, entry.as_str()),
        };
        let matched = pattern == "*"
            || host == pattern.trim_start_matches('.')
            || (pattern.starts_with('.') && host.ends_with(pattern));
        if matched {
            allowed = !negate;
        }
    }
    allowed
}
