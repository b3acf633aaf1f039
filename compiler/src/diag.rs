// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all pipelining passes.
// Diagnostics attach to IR operations rather than source spans; the passes
// never see source text.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::id::OpId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`, `W0100`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Descriptor materialization nested under a construct other than a
    /// single-entry conditional.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Loop carries a stage count but has no eligible load.
    pub const W0100: DiagCode = DiagCode("W0100");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related op ───────────────────────────────────────────────────────────

/// A secondary operation providing context for a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedOp {
    pub op: OpId,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub op: Option<OpId>,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<RelatedOp>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or related ops.
    pub fn new(level: DiagLevel, op: Option<OpId>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            op,
            message: message.into(),
            hint: None,
            related: Vec::new(),
        }
    }

    pub fn error(op: OpId, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, Some(op), message)
    }

    pub fn warning(op: OpId, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, Some(op), message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related operation.
    pub fn with_related(mut self, op: OpId, label: impl Into<String>) -> Self {
        self.related.push(RelatedOp {
            op,
            label: label.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(op) = self.op {
            write!(f, "\n  at {}", op)?;
        }
        for related in &self.related {
            write!(f, "\n  note: {} ({})", related.label, related.op)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
