//! Typed results of debuggee queries.
//!
//! Wire shapes follow the DAP schema (camelCase field names); fields not
//! modelled here are ignored on decode.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A source file and line a breakpoint is keyed by.
///
/// Ordered by path, then line, so one file's breakpoints sort together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceLocation {
    /// Source file path as the adapter sees it.
    pub path: PathBuf,
    /// One-based line number.
    pub line: i64,
}

impl SourceLocation {
    /// Create a location.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, line: i64) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }

    /// Parse `file:line`, splitting on the last colon.
    #[must_use]
    pub fn parse(spec: &str) -> Option<Self> {
        let (path, line) = spec.rsplit_once(':')?;
        let line = line.parse().ok().filter(|line| *line > 0)?;
        if path.is_empty() {
            return None;
        }
        Some(Self::new(path, line))
    }
}

/// A breakpoint as recorded by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Breakpoint {
    /// Adapter-assigned identifier, when the adapter supplies one.
    pub id: Option<i64>,
    /// Whether the adapter could bind the breakpoint.
    pub verified: bool,
    /// Location the breakpoint was requested at.
    pub location: SourceLocation,
    /// Line the adapter actually bound to, if it moved.
    pub line: Option<i64>,
    /// Condition expression.
    pub condition: Option<String>,
    /// Adapter explanation, typically for unverified breakpoints.
    pub message: Option<String>,
}

/// Breakpoint entry of a `setBreakpoints` response or `breakpoint` event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireBreakpoint {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A debuggee thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Thread identifier.
    pub id: i64,
    /// Thread name.
    #[serde(default)]
    pub name: String,
}

/// Source reference inside a stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Short display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// File path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One frame of a thread's call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    /// Frame identifier, valid while the debuggee stays stopped.
    pub id: i64,
    /// Function or frame name.
    pub name: String,
    /// Source the frame executes in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// Current line.
    #[serde(default)]
    pub line: i64,
    /// Current column.
    #[serde(default)]
    pub column: i64,
}

/// A variable scope of a stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Scope name, e.g. `Locals`.
    pub name: String,
    /// Reference used to fetch the scope's variables.
    pub variables_reference: i64,
    /// Whether fetching the variables is expensive.
    #[serde(default)]
    pub expensive: bool,
}

/// A named value inside a scope or structured variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    /// Variable name.
    pub name: String,
    /// Rendered value.
    pub value: String,
    /// Type name, when the adapter supports variable types.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Non-zero when the value has children.
    #[serde(default)]
    pub variables_reference: i64,
}

/// Result of an `evaluate` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    /// Rendered result.
    pub result: String,
    /// Result type name.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Non-zero when the result has children.
    #[serde(default)]
    pub variables_reference: i64,
}

/// Debuggee output captured from an `output` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OutputLine {
    /// Output category, e.g. `stdout`, `stderr`, `console`.
    pub category: String,
    /// Output text as sent by the adapter.
    pub output: String,
}
