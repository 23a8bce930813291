//! Upload-pack request parser: turns the client's raw wire-format body
//! into a typed [`Request`] plus a stable content-addressed
//! [`Request::fingerprint`]. Protocol v1 and v2 share a fingerprint
//! algorithm and cacheability predicate; only the grammar differs.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::pktline::{self, Packet};

/// The 24-entry v1 capability vocabulary. Anything else is logged and
/// dropped, not rejected.
const V1_CAPS: &[&str] = &[
    "multi_ack",
    "multi_ack_detailed",
    "no-done",
    "thin-pack",
    "side-band",
    "side-band-64k",
    "ofs-delta",
    "agent",
    "symref",
    "shallow",
    "deepen-since",
    "deepen-not",
    "deepen-relative",
    "no-progress",
    "include-tag",
    "report-status",
    "report-status-v2",
    "delete-refs",
    "quiet",
    "atomic",
    "push-options",
    "allow-tip-sha1-in-want",
    "allow-reachable-sha1-in-want",
    "push-cert",
];

/// Protocol v2's single-entry capability vocabulary.
const V2_CAPS: &[&str] = &["agent"];

/// Protocol v2 `fetch` command argument vocabulary.
const ARGS: &[&str] = &[
    "want",
    "have",
    "done",
    "thin-pack",
    "no-progress",
    "include-tag",
    "ofs-delta",
    "shallow",
    "deepen",
    "deepen-relative",
    "deepen-since",
    "deepen-not",
    "filter",
    "want-ref",
    "sideband-all",
    "packfile-uris",
    "wait-for-done",
];

/// A value associated with a capability or argument key: either a bare flag
/// (`thin-pack`) or a `key=value`/`key value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapValue {
    Flag,
    Value(String),
}

/// The v2 top-level command, or its implicit v1 equivalent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Fetch,
    LsRefs,
    ObjectInfo,
    Other(String),
    /// No `command=` line was present at all (an empty v2 request).
    Empty,
    /// Protocol v1 has no explicit command; `fetch` is implied.
    V1Implicit,
}

/// A parsed upload-pack request.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    pub caps: BTreeMap<String, CapValue>,
    pub wants: Vec<String>,
    pub haves: Vec<String>,
    /// `None` for v1 (which has no separate args block); `Some` for v2.
    pub args: Option<BTreeMap<String, CapValue>>,
    pub done: bool,
    pub depth: bool,
    pub depth_lines: Vec<String>,
    pub filter: bool,
    pub fingerprint: String,
    pub parse_error: bool,
    pub input: Vec<u8>,
}

/// Marker error: on any parse failure we don't bother explaining why, since
/// the caller's only recourse is to emit a generic "wrong upload pack input"
/// error back to the client and move on.
struct ParseFail;

impl From<pktline::PktLineError> for ParseFail {
    fn from(_: pktline::PktLineError) -> Self {
        ParseFail
    }
}

struct Fields {
    command: Command,
    caps: BTreeMap<String, CapValue>,
    wants: Vec<String>,
    haves: Vec<String>,
    args: Option<BTreeMap<String, CapValue>>,
    done: bool,
    depth: bool,
    depth_lines: Vec<String>,
    filter: bool,
}

impl Request {
    /// Parse a complete client request body. `protocol_version` comes from
    /// the `Git-Protocol: version=N` header (or `0`/`1` if absent).
    pub fn parse(input: &[u8], protocol_version: u32) -> Request {
        let result = if protocol_version >= 2 {
            parse_v2(input)
        } else {
            parse_v1(input)
        };

        match result {
            Ok(fields) => {
                let fingerprint = compute_fingerprint(
                    &fields.caps,
                    &fields.haves,
                    &fields.wants,
                    fields.args.as_ref(),
                    &fields.depth_lines,
                    fields.done,
                );
                Request {
                    command: fields.command,
                    caps: fields.caps,
                    wants: fields.wants,
                    haves: fields.haves,
                    args: fields.args,
                    done: fields.done,
                    depth: fields.depth,
                    depth_lines: fields.depth_lines,
                    filter: fields.filter,
                    fingerprint,
                    parse_error: false,
                    input: input.to_vec(),
                }
            }
            Err(ParseFail) => Request::parse_error(input),
        }
    }

    fn parse_error(input: &[u8]) -> Request {
        Request {
            command: Command::Empty,
            caps: BTreeMap::new(),
            wants: Vec::new(),
            haves: Vec::new(),
            args: None,
            done: false,
            depth: false,
            depth_lines: Vec::new(),
            filter: false,
            // Fresh random fingerprint so a malformed request never
            // produces an accidental cache hit.
            fingerprint: uuid::Uuid::new_v4().simple().to_string(),
            parse_error: true,
            input: input.to_vec(),
        }
    }

    /// Cacheability predicate, parameterised over the two env-driven
    /// relaxations (`PACK_CACHE_MULTI`, `PACK_CACHE_DEPTH`).
    pub fn can_be_cached(&self, multi_allowed: bool, depth_allowed: bool) -> bool {
        if !self.done || !self.haves.is_empty() {
            return false;
        }
        if self.filter {
            return false;
        }
        if !multi_allowed && self.wants.len() > 1 {
            return false;
        }
        if !depth_allowed && self.depth {
            return false;
        }
        if matches!(self.command, Command::V1Implicit) {
            let has_sideband =
                self.caps.contains_key("side-band") || self.caps.contains_key("side-band-64k");
            if !has_sideband {
                return false;
            }
        }
        true
    }
}

fn push_unique(v: &mut Vec<String>, item: String) {
    if !v.contains(&item) {
        v.push(item);
    }
}

fn decode_line(bytes: &[u8]) -> Result<String, ParseFail> {
    let s = std::str::from_utf8(bytes).map_err(|_| ParseFail)?;
    Ok(s.strip_suffix('\n').unwrap_or(s).to_string())
}

fn compute_fingerprint(
    caps: &BTreeMap<String, CapValue>,
    haves: &[String],
    wants: &[String],
    args: Option<&BTreeMap<String, CapValue>>,
    depth_lines: &[String],
    done: bool,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"caps");
    for k in caps.keys() {
        hasher.update(k.as_bytes());
    }
    hasher.update(b"haves");
    let mut sorted: Vec<&str> = haves.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    for h in &sorted {
        hasher.update(h.as_bytes());
    }
    hasher.update(b"wants");
    let mut sorted: Vec<&str> = wants.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    for w in &sorted {
        hasher.update(w.as_bytes());
    }
    if let Some(args) = args {
        hasher.update(b"args");
        for k in args.keys() {
            hasher.update(k.as_bytes());
        }
    }
    let mut sorted: Vec<&str> = depth_lines.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    for d in &sorted {
        hasher.update(d.as_bytes());
    }
    if done {
        hasher.update(b"done");
    }
    hex::encode(hasher.finalize())
}

/// Protocol v1 grammar: `want <oid> <caps...>\n`, then any number of
/// `want`/`have`/`done`/`deepen-*` lines separated by flush packets.
fn parse_v1(input: &[u8]) -> Result<Fields, ParseFail> {
    let packets = pktline::parse_buffer(input)?;
    let mut iter = packets.into_iter();

    let mut wants = Vec::new();
    let mut caps = BTreeMap::new();
    let mut filter = false;

    match iter.next() {
        None | Some(Packet::Flush) => {
            // Empty body, or a leading flush with nothing else: an
            // empty-wants request. The handler returns silently on this
            // rather than treating it as malformed.
        }
        Some(Packet::Data(bytes)) => {
            let line = decode_line(&bytes)?;
            let mut parts = line.split(' ');
            let keyword = parts.next().ok_or(ParseFail)?;
            if !keyword.eq_ignore_ascii_case("want") {
                return Err(ParseFail);
            }
            wants.push(parts.next().ok_or(ParseFail)?.to_string());
            for cap in parts {
                if cap.is_empty() {
                    continue;
                }
                let (key, value) = match cap.split_once('=') {
                    Some((k, v)) => (k.to_string(), CapValue::Value(v.to_string())),
                    None => (cap.to_string(), CapValue::Flag),
                };
                if key == "filter" {
                    filter = true;
                }
                if V1_CAPS.contains(&key.as_str()) {
                    caps.insert(key, value);
                } else {
                    tracing::debug!(cap = %key, "unknown v1 capability, ignoring");
                }
            }
        }
        Some(Packet::Delim) | Some(Packet::ResponseEnd) => return Err(ParseFail),
    }

    let mut haves = Vec::new();
    let mut done = false;
    let mut depth = false;
    let mut depth_lines = Vec::new();

    for pkt in iter {
        match pkt {
            Packet::Flush => continue,
            Packet::Delim | Packet::ResponseEnd => return Err(ParseFail),
            Packet::Data(bytes) => {
                let line = decode_line(&bytes)?;
                let mut parts = line.splitn(2, ' ');
                let keyword = parts.next().unwrap_or("");
                let rest = parts.next().unwrap_or("");
                let keyword_lower = keyword.to_lowercase();
                match keyword_lower.as_str() {
                    "want" => push_unique(&mut wants, rest.to_string()),
                    "have" => push_unique(&mut haves, rest.to_string()),
                    "done" => done = true,
                    _ => {}
                }
                if keyword_lower.contains("deep") {
                    depth = true;
                    depth_lines.push(line);
                }
            }
        }
    }

    Ok(Fields {
        command: Command::V1Implicit,
        caps,
        wants,
        haves,
        args: None,
        done,
        depth,
        depth_lines,
        filter,
    })
}

/// Protocol v2 grammar: an optional `command=`/capability block, a DELIM,
/// then command-specific argument lines, terminated by FLUSH.
fn parse_v2(input: &[u8]) -> Result<Fields, ParseFail> {
    let packets = pktline::parse_buffer(input)?;
    let mut iter = packets.into_iter();

    let command = match iter.next().ok_or(ParseFail)? {
        Packet::Flush => Command::Empty,
        Packet::Delim | Packet::ResponseEnd => return Err(ParseFail),
        Packet::Data(bytes) => {
            let line = decode_line(&bytes)?;
            let (key, value) = line.split_once('=').ok_or(ParseFail)?;
            if !key.eq_ignore_ascii_case("command") {
                return Err(ParseFail);
            }
            match value {
                "fetch" => Command::Fetch,
                "ls-refs" => Command::LsRefs,
                "object-info" => Command::ObjectInfo,
                other => Command::Other(other.to_string()),
            }
        }
    };

    let mut caps = BTreeMap::new();
    loop {
        match iter.next().ok_or(ParseFail)? {
            Packet::Flush | Packet::Delim => break,
            Packet::ResponseEnd => return Err(ParseFail),
            Packet::Data(bytes) => {
                let line = decode_line(&bytes)?;
                if let Some((key, value)) = line.split_once('=') {
                    if key.eq_ignore_ascii_case("command") {
                        // A second command= line: two commands in one request.
                        return Err(ParseFail);
                    }
                    if V2_CAPS.contains(&key) {
                        caps.insert(key.to_string(), CapValue::Value(value.to_string()));
                    } else {
                        tracing::debug!(cap = %key, "unknown v2 capability, ignoring");
                    }
                } else {
                    if line.eq_ignore_ascii_case("command") {
                        return Err(ParseFail);
                    }
                    if V2_CAPS.contains(&line.as_str()) {
                        caps.insert(line, CapValue::Flag);
                    } else {
                        tracing::debug!(cap = %line, "unknown v2 capability, ignoring");
                    }
                }
            }
        }
    }

    if command != Command::Fetch {
        // ls-refs/object-info/anything else: no local handling, the HTTP
        // surface passes the whole body through to upstream verbatim.
        return Ok(Fields {
            command,
            caps,
            wants: Vec::new(),
            haves: Vec::new(),
            args: Some(BTreeMap::new()),
            done: false,
            depth: false,
            depth_lines: Vec::new(),
            filter: false,
        });
    }

    let mut wants = Vec::new();
    let mut haves = Vec::new();
    let mut args = BTreeMap::new();
    let mut done = false;
    let mut depth = false;
    let mut depth_lines = Vec::new();

    loop {
        match iter.next().ok_or(ParseFail)? {
            Packet::Flush => break,
            Packet::Delim | Packet::ResponseEnd => return Err(ParseFail),
            Packet::Data(bytes) => {
                let line = decode_line(&bytes)?;
                let key_lower = if let Some((key, value)) = line.split_once(' ') {
                    let key_lower = key.to_lowercase();
                    match key_lower.as_str() {
                        "have" => push_unique(&mut haves, value.to_string()),
                        "want" => push_unique(&mut wants, value.to_string()),
                        _ => {
                            if ARGS.contains(&key_lower.as_str()) {
                                args.insert(key.to_string(), CapValue::Value(value.to_string()));
                            } else {
                                tracing::debug!(arg = %key, "unknown v2 arg, ignoring");
                            }
                        }
                    }
                    key_lower
                } else {
                    let key_lower = line.to_lowercase();
                    if key_lower == "done" {
                        done = true;
                    }
                    if ARGS.contains(&key_lower.as_str()) {
                        args.insert(line.clone(), CapValue::Flag);
                    } else {
                        tracing::debug!(arg = %line, "unknown v2 arg, ignoring");
                    }
                    key_lower
                };
                if key_lower.contains("deep") {
                    depth = true;
                    depth_lines.push(line);
                }
            }
        }
    }

    let filter = args.contains_key("filter");

    Ok(Fields {
        command,
        caps,
        wants,
        haves,
        args: Some(args),
        done,
        depth,
        depth_lines,
        filter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pkt(s: &str) -> Vec<u8> {
        crate::pktline::encode(s.as_bytes(), None)
    }

    #[test]
    fn v1_single_want_is_cacheable() {
        let mut body = Vec::new();
        body.extend(pkt(
            "want 4284b1521b200ba4934ee710a4a538549f1f0f97 side-band-64k thin-pack ofs-delta agent=git/2.15.1\n",
        ));
        body.extend(crate::pktline::flush());
        body.extend(pkt("done\n"));
        let req = Request::parse(&body, 1);
        assert!(!req.parse_error);
        assert_eq!(req.wants, vec!["4284b1521b200ba4934ee710a4a538549f1f0f97".to_string()]);
        assert!(req.done);
        assert!(req.can_be_cached(false, false));
    }

    #[test]
    fn v1_two_wants_not_cacheable_by_default() {
        let mut body = Vec::new();
        body.extend(pkt(
            "want 4284b1521b200ba4934ee710a4a538549f1f0f97 multi_ack_detailed no-done side-band-64k thin-pack ofs-delta deepen-since deepen-not agent=git/2.15.1\n",
        ));
        body.extend(pkt("want 8f6312ec029e7290822bed826a05fd81e65b3b7c\n"));
        body.extend(crate::pktline::flush());
        body.extend(pkt("done\n"));
        let req = Request::parse(&body, 1);
        assert!(!req.parse_error);
        assert_eq!(req.wants.len(), 2);
        assert!(!req.can_be_cached(false, false));
        assert!(req.can_be_cached(true, false));
    }

    #[test]
    fn fingerprint_ignores_agent_value() {
        let mk = |agent: &str| {
            let mut body = Vec::new();
            body.extend(pkt(&format!(
                "want 4284b1521b200ba4934ee710a4a538549f1f0f97 side-band-64k agent={agent}\n"
            )));
            body.extend(crate::pktline::flush());
            body.extend(pkt("done\n"));
            Request::parse(&body, 1).fingerprint
        };
        assert_eq!(mk("git/2.15.1"), mk("git/2.40.0"));
    }

    #[test]
    fn empty_body_parses_to_no_wants() {
        let req = Request::parse(b"", 1);
        assert!(!req.parse_error);
        assert!(req.wants.is_empty());
    }

    #[test]
    fn flush_only_body_parses_to_no_wants() {
        let req = Request::parse(&crate::pktline::flush(), 1);
        assert!(!req.parse_error);
        assert!(req.wants.is_empty());
    }

    #[test]
    fn invalid_header_is_a_parse_error() {
        // header declares 0x1a4 total length, but only 3 bytes remain
        let req = Request::parse(b"01a4abc", 1);
        assert!(req.parse_error);
    }

    #[test]
    fn v2_fetch_fingerprint_is_deterministic_and_well_formed() {
        // The exact digest is an implementation detail of the canonical
        // serialization; what's externally observable and worth pinning
        // down is determinism, hex shape, and that it reacts to the fields
        // it's supposed to react to.
        let mut body = Vec::new();
        body.extend(pkt("command=fetch"));
        body.extend(pkt("agent=git/2.25.1"));
        body.extend(crate::pktline::delim());
        body.extend(pkt("thin-pack"));
        body.extend(pkt("ofs-delta"));
        body.extend(pkt("want fcd062d2d06d00fc2a1bf3c8432effccbd186a08\n"));
        body.extend(pkt("want 44667f210351a1a425a6463a204f32279d3b24f3\n"));
        body.extend(pkt("done\n"));
        body.extend(crate::pktline::flush());

        let req1 = Request::parse(&body, 2);
        let req2 = Request::parse(&body, 2);
        assert!(!req1.parse_error);
        assert_eq!(req1.fingerprint, req2.fingerprint);
        assert_eq!(req1.fingerprint.len(), 64);
        assert!(req1.fingerprint.chars().all(|c| c.is_ascii_hexdigit()));

        // Reordering the two wants in the wire request must not change the
        // fingerprint: wants are sorted before hashing.
        let mut reordered = Vec::new();
        reordered.extend(pkt("command=fetch"));
        reordered.extend(pkt("agent=git/2.25.1"));
        reordered.extend(crate::pktline::delim());
        reordered.extend(pkt("thin-pack"));
        reordered.extend(pkt("ofs-delta"));
        reordered.extend(pkt("want 44667f210351a1a425a6463a204f32279d3b24f3\n"));
        reordered.extend(pkt("want fcd062d2d06d00fc2a1bf3c8432effccbd186a08\n"));
        reordered.extend(pkt("done\n"));
        reordered.extend(crate::pktline::flush());
        let req3 = Request::parse(&reordered, 2);
        assert_eq!(req1.fingerprint, req3.fingerprint);
    }

    /// Literal input from spec §8 scenario 4, byte-for-byte: a v2 fetch
    /// request with `agent=` and two `want` lines, no `have`s, terminated
    /// by `done`. The fingerprint is pinned to the exact hex digest the
    /// spec names for this input.
    #[test]
    fn v2_fetch_fingerprint_matches_spec_scenario_4() {
        let body: &[u8] = b"0011command=fetch0014agent=git/2.25.10001000dthin-pack000dofs-delta0032want fcd062d2d06d00fc2a1bf3c8432effccbd186a08\n0032want 44667f210351a1a425a6463a204f32279d3b24f3\n0009done\n0000";
        let req = Request::parse(body, 2);
        assert!(!req.parse_error);
        assert_eq!(
            req.fingerprint,
            "1e95621aee9bfc6f9d7eae5aaa9e31c6d8e482f7542b4ce1145e08d0328c9ea8"
        );
    }

    #[test]
    fn v2_two_commands_is_a_parse_error() {
        let mut body = Vec::new();
        body.extend(pkt("command=fetch"));
        body.extend(pkt("command=ls-refs"));
        body.extend(crate::pktline::delim());
        body.extend(crate::pktline::flush());
        let req = Request::parse(&body, 2);
        assert!(req.parse_error);
    }

    #[test]
    fn v2_unknown_arg_is_ignored_not_rejected() {
        let mut body = Vec::new();
        body.extend(pkt("command=fetch"));
        body.extend(crate::pktline::delim());
        body.extend(pkt("made-up-arg\n"));
        body.extend(pkt("want fcd062d2d06d00fc2a1bf3c8432effccbd186a08\n"));
        body.extend(pkt("done\n"));
        body.extend(crate::pktline::flush());
        let req = Request::parse(&body, 2);
        assert!(!req.parse_error);
        assert_eq!(req.wants.len(), 1);
    }
}
