//! ACL pattern engine (§4.11): compiles IPv4/IPv6 wildcard/netmask/range
//! patterns into fixed-length programs of micro-ops and matches addresses
//! against them.

use std::fmt;
use std::net::IpAddr;

/// One micro-op in a compiled ACL program. IPv4 programs have exactly four
/// components (8-bit); IPv6 programs have exactly eight (16-bit), expressed
/// here as `u32` so both widths share one op type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// The next component must equal `c` exactly.
    Match(u32),
    /// The next component matches anything (`*`).
    Any,
    /// The next component must fall within `[lo, hi]` inclusive.
    Range(u32, u32),
    /// The next `n` components must all be zero (expresses IPv6 `::` and
    /// IPv4 netmask tails).
    ZRange(u8),
    /// The next `n` components are all wildcards (mask widening).
    AnyRange(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// One compiled ACL entry: the op program for a single family plus its
/// negation flag.
#[derive(Debug, Clone)]
pub struct Program {
    pub family: Family,
    pub ops: Vec<Op>,
    pub negate: bool,
    pub source_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclCompileError(pub String);

impl fmt::Display for AclCompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AclCompileError {}

const V4_MASK_BITS: [u32; 5] = [0, 8, 16, 24, 32];
const V6_MASK_BITS: [u32; 9] = [0, 16, 32, 48, 64, 80, 96, 112, 128];

/// Compiles one `acl { ... }` entry's pattern text (without the trailing
/// `;` or leading `!`) into a [`Program`]. `negate` is carried separately
/// since the `!` prefix is stripped by the parser before this is called.
pub fn compile_entry(pattern: &str, negate: bool) -> Result<Program, AclCompileError> {
    let pattern = pattern.trim();
    if let Some((addr_part, mask_part)) = pattern.split_once('/') {
        if pattern.contains('*') || pattern.contains('[') {
            return Err(AclCompileError(format!("mixed wildcard and netmask in '{pattern}'")));
        }
        let bits: u32 =
            mask_part.parse().map_err(|_| AclCompileError(format!("invalid netmask in '{pattern}'")))?;
        return compile_netmask(addr_part, bits, negate, pattern);
    }
    compile_wildcard(pattern, negate)
}

fn compile_netmask(addr: &str, bits: u32, negate: bool, source: &str) -> Result<Program, AclCompileError> {
    let ip: IpAddr = addr.parse().map_err(|_| AclCompileError(format!("invalid address in '{source}'")))?;
    match ip {
        IpAddr::V4(v4) => {
            if !V4_MASK_BITS.contains(&bits) {
                return Err(AclCompileError(format!("invalid ipv4 netmask /{bits} in '{source}'")));
            }
            let octets = v4.octets();
            let whole = (bits / 8) as usize;
            let mut ops = Vec::with_capacity(4);
            for &o in octets.iter().take(whole) {
                ops.push(Op::Match(u32::from(o)));
            }
            let remaining = 4 - whole;
            if remaining > 0 {
                ops.push(Op::AnyRange(remaining as u8));
            }
            Ok(Program { family: Family::V4, ops, negate, source_text: source.to_string() })
        }
        IpAddr::V6(v6) => {
            if !V6_MASK_BITS.contains(&bits) {
                return Err(AclCompileError(format!("invalid ipv6 netmask /{bits} in '{source}'")));
            }
            let segs = v6.segments();
            let whole = (bits / 16) as usize;
            let mut ops = Vec::with_capacity(8);
            for &s in segs.iter().take(whole) {
                ops.push(Op::Match(u32::from(s)));
            }
            let remaining = 8 - whole;
            if remaining > 0 {
                ops.push(Op::AnyRange(remaining as u8));
            }
            Ok(Program { family: Family::V6, ops, negate, source_text: source.to_string() })
        }
    }
}

/// Parses a wildcard/range pattern like `192.168.*.*`, `10.0.[0-255].1`, or
/// `fe80::*` into a component-program. `::` condenses a run of zero
/// components into one `ZRange`.
fn compile_wildcard(pattern: &str, negate: bool) -> Result<Program, AclCompileError> {
    if pattern.contains(':') {
        compile_wildcard_v6(pattern, negate)
    } else {
        compile_wildcard_v4(pattern, negate)
    }
}

fn parse_component(text: &str, max: u32) -> Result<Op, AclCompileError> {
    if text == "*" {
        return Ok(Op::Any);
    }
    if let Some(inner) = text.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let (lo, hi) = inner.split_once('-').ok_or_else(|| AclCompileError(format!("bad range '{text}'")))?;
        let lo: u32 = lo.parse().map_err(|_| AclCompileError(format!("bad range '{text}'")))?;
        let hi: u32 = hi.parse().map_err(|_| AclCompileError(format!("bad range '{text}'")))?;
        if lo > hi || hi > max {
            return Err(AclCompileError(format!("range out of bounds '{text}'")));
        }
        return Ok(Op::Range(lo, hi));
    }
    let v: u32 = text.parse().map_err(|_| AclCompileError(format!("bad component '{text}'")))?;
    if v > max {
        return Err(AclCompileError(format!("component out of range '{text}'")));
    }
    Ok(Op::Match(v))
}

fn compile_wildcard_v4(pattern: &str, negate: bool) -> Result<Program, AclCompileError> {
    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.len() != 4 {
        return Err(AclCompileError(format!("ipv4 pattern must have 4 components: '{pattern}'")));
    }
    let ops = parts.iter().map(|p| parse_component(p, 255)).collect::<Result<Vec<_>, _>>()?;
    Ok(Program { family: Family::V4, ops, negate, source_text: pattern.to_string() })
}

fn compile_wildcard_v6(pattern: &str, negate: bool) -> Result<Program, AclCompileError> {
    if let Some((left, right)) = pattern.split_once("::") {
        let left_parts: Vec<&str> = if left.is_empty() { Vec::new() } else { left.split(':').collect() };
        let right_parts: Vec<&str> = if right.is_empty() { Vec::new() } else { right.split(':').collect() };
        let filled = left_parts.len() + right_parts.len();
        if filled > 8 {
            return Err(AclCompileError(format!("too many components in '{pattern}'")));
        }
        let mut ops = Vec::with_capacity(8);
        for p in &left_parts {
            ops.push(parse_hextet(p)?);
        }
        ops.push(Op::ZRange((8 - filled) as u8));
        for p in &right_parts {
            ops.push(parse_hextet(p)?);
        }
        Ok(Program { family: Family::V6, ops, negate, source_text: pattern.to_string() })
    } else {
        let parts: Vec<&str> = pattern.split(':').collect();
        if parts.len() != 8 {
            return Err(AclCompileError(format!("ipv6 pattern must have 8 components: '{pattern}'")));
        }
        let ops = parts.iter().map(|p| parse_hextet(p)).collect::<Result<Vec<_>, _>>()?;
        Ok(Program { family: Family::V6, ops, negate, source_text: pattern.to_string() })
    }
}

fn parse_hextet(text: &str) -> Result<Op, AclCompileError> {
    if text == "*" {
        return Ok(Op::Any);
    }
    if let Some(inner) = text.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let (lo, hi) = inner.split_once('-').ok_or_else(|| AclCompileError(format!("bad range '{text}'")))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| AclCompileError(format!("bad range '{text}'")))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| AclCompileError(format!("bad range '{text}'")))?;
        if lo > hi || hi > 0xffff {
            return Err(AclCompileError(format!("range out of bounds '{text}'")));
        }
        return Ok(Op::Range(lo, hi));
    }
    let v = u32::from_str_radix(text, 16).map_err(|_| AclCompileError(format!("bad hextet '{text}'")))?;
    if v > 0xffff {
        return Err(AclCompileError(format!("hextet out of range '{text}'")));
    }
    Ok(Op::Match(v))
}

fn components(addr: &IpAddr) -> (Family, Vec<u32>) {
    match addr {
        IpAddr::V4(v4) => (Family::V4, v4.octets().iter().map(|&b| u32::from(b)).collect()),
        IpAddr::V6(v6) => (Family::V6, v6.segments().iter().map(|&s| u32::from(s)).collect()),
    }
}

/// Evaluates one program against an already-decomposed address. Returns
/// the raw (pre-negation) match result, or `None` if the program's family
/// doesn't match the address's.
fn program_matches(program: &Program, family: Family, parts: &[u32]) -> Option<bool> {
    if program.family != family {
        return None;
    }
    let mut i = 0usize;
    for op in &program.ops {
        match *op {
            Op::Match(c) => {
                if parts.get(i) != Some(&c) {
                    return Some(false);
                }
                i += 1;
            }
            Op::Any => {
                i += 1;
            }
            Op::Range(lo, hi) => {
                match parts.get(i) {
                    Some(&v) if v >= lo && v <= hi => {}
                    _ => return Some(false),
                }
                i += 1;
            }
            Op::ZRange(n) => {
                for _ in 0..n {
                    match parts.get(i) {
                        Some(0) => {}
                        _ => return Some(false),
                    }
                    i += 1;
                }
            }
            Op::AnyRange(n) => {
                i += n as usize;
            }
        }
    }
    Some(i == parts.len())
}

/// A compiled ACL: an ordered list of programs. [`Acl::matches`] returns
/// true if any program matches, with that program's negation flag applied.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    pub programs: Vec<Program>,
}

impl Acl {
    pub fn matches(&self, addr: IpAddr) -> bool {
        let (family, parts) = components(&addr);
        for program in &self.programs {
            if let Some(hit) = program_matches(program, family, &parts) {
                if hit {
                    return !program.negate;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn wildcard_matches() {
        let p = compile_entry("192.168.*.*", false).unwrap();
        let acl = Acl { programs: vec![p] };
        assert!(acl.matches(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!acl.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn range_matches() {
        let p = compile_entry("10.0.[0-10].1", false).unwrap();
        let acl = Acl { programs: vec![p] };
        assert!(acl.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 5, 1))));
        assert!(!acl.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 11, 1))));
    }

    #[test]
    fn netmask_matches() {
        let p = compile_entry("10.0.0.0/24", false).unwrap();
        let acl = Acl { programs: vec![p] };
        assert!(acl.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200))));
        assert!(!acl.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 200))));
    }

    #[test]
    fn negation_flips_result() {
        let p = compile_entry("10.0.0.0/24", true).unwrap();
        let acl = Acl { programs: vec![p] };
        assert!(!acl.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200))));
        assert!(acl.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 200))));
    }

    #[test]
    fn mixed_wildcard_and_netmask_rejected() {
        assert!(compile_entry("10.0.*.0/24", false).is_err());
    }

    #[test]
    fn ipv6_condensation() {
        let p = compile_entry("fe80::1", false).unwrap();
        let acl = Acl { programs: vec![p] };
        assert!(acl.matches("fe80::1".parse().unwrap()));
        assert!(!acl.matches("fe80::2".parse().unwrap()));
    }
}
