#![forbid(unsafe_code)]

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(pub u32);

/// Nanoseconds since the Unix epoch, as handed out by the clock seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicTimeNs(pub u64);

impl MonotonicTimeNs {
    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms_to_ns(ms)))
    }

    /// Whole milliseconds elapsed from `earlier` to `self`; zero when `earlier` is in the future.
    pub fn ms_since(self, earlier: MonotonicTimeNs) -> u64 {
        self.0.saturating_sub(earlier.0) / 1_000_000
    }

    /// Whole milliseconds left until `later`; zero once it has passed.
    pub fn ms_until(self, later: MonotonicTimeNs) -> u64 {
        later.0.saturating_sub(self.0) / 1_000_000
    }
}

pub fn ms_to_ns(ms: u64) -> u64 {
    ms.saturating_mul(1_000_000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReasonCodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field} out of range {min}..={max}: got {got}")]
    InvalidRange {
        field: &'static str,
        min: u64,
        max: u64,
        got: u64,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

pub(crate) fn validate_ascii_token(
    field: &'static str,
    s: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if s.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if s.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "too long",
        });
    }
    if !s.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be printable ASCII without whitespace",
        });
    }
    Ok(())
}

pub(crate) fn validate_lower_hex(
    field: &'static str,
    s: &str,
    len: usize,
) -> Result<(), ContractViolation> {
    if s.len() != len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "unexpected length",
        });
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be lowercase hex",
        });
    }
    Ok(())
}

pub(crate) fn validate_range(
    field: &'static str,
    got: u64,
    min: u64,
    max: u64,
) -> Result<(), ContractViolation> {
    if got < min || got > max {
        return Err(ContractViolation::InvalidRange {
            field,
            min,
            max,
            got,
        });
    }
    Ok(())
}
