use std::fmt;

use thiserror::Error;

use crate::dsl::ast::Span;

/// User-visible error kinds. Each maps to a catchable family name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parsing,
    Assertion,
    RequiredDirection,
    IncompatibleInCarriagePass,
    RepeatedNeedle,
    AllNeedleOperation,
    NoDeclaredCarrier,
    GaugeValue,
    SheetValue,
    SheetPeelingStackedLoops,
    SheetPeelingBlockedLoops,
    LostSheetLoops,
    /// Machine-state violation (wrong racking, inactive carrier, needle out of range).
    Knitting,
    Name,
    Attribute,
    Type,
    Index,
    Key,
    Import,
    Value,
    ZeroDivision,
    Io,
    Config,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 23] = [
        ErrorKind::Parsing,
        ErrorKind::Assertion,
        ErrorKind::RequiredDirection,
        ErrorKind::IncompatibleInCarriagePass,
        ErrorKind::RepeatedNeedle,
        ErrorKind::AllNeedleOperation,
        ErrorKind::NoDeclaredCarrier,
        ErrorKind::GaugeValue,
        ErrorKind::SheetValue,
        ErrorKind::SheetPeelingStackedLoops,
        ErrorKind::SheetPeelingBlockedLoops,
        ErrorKind::LostSheetLoops,
        ErrorKind::Knitting,
        ErrorKind::Name,
        ErrorKind::Attribute,
        ErrorKind::Type,
        ErrorKind::Index,
        ErrorKind::Key,
        ErrorKind::Import,
        ErrorKind::Value,
        ErrorKind::ZeroDivision,
        ErrorKind::Io,
        ErrorKind::Config,
    ];

    /// Name used in `catch` clauses and in error reports.
    pub fn family_name(self) -> &'static str {
        match self {
            ErrorKind::Parsing => "Parsing_Exception",
            ErrorKind::Assertion => "Knit_Script_Assertion",
            ErrorKind::RequiredDirection => "Required_Direction",
            ErrorKind::IncompatibleInCarriagePass => "Incompatible_In_Carriage_Pass",
            ErrorKind::RepeatedNeedle => "Repeated_Needle",
            ErrorKind::AllNeedleOperation => "All_Needle_Operation",
            ErrorKind::NoDeclaredCarrier => "No_Declared_Carrier",
            ErrorKind::GaugeValue => "Gauge_Value",
            ErrorKind::SheetValue => "Sheet_Value",
            ErrorKind::SheetPeelingStackedLoops => "Sheet_Peeling_Stacked_Loops",
            ErrorKind::SheetPeelingBlockedLoops => "Sheet_Peeling_Blocked_Loops",
            ErrorKind::LostSheetLoops => "Lost_Sheet_Loops",
            ErrorKind::Knitting => "Knitting_Exception",
            ErrorKind::Name => "NameError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Value => "ValueError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Io => "IOError",
            ErrorKind::Config => "ConfigError",
        }
    }

    fn is_knit_script_specific(self) -> bool {
        !matches!(
            self,
            ErrorKind::Name
                | ErrorKind::Attribute
                | ErrorKind::Type
                | ErrorKind::Index
                | ErrorKind::Key
                | ErrorKind::Import
                | ErrorKind::Value
                | ErrorKind::ZeroDivision
                | ErrorKind::Io
                | ErrorKind::Config
        )
    }

    fn is_gauge_sheet(self) -> bool {
        matches!(
            self,
            ErrorKind::GaugeValue
                | ErrorKind::SheetValue
                | ErrorKind::SheetPeelingStackedLoops
                | ErrorKind::SheetPeelingBlockedLoops
                | ErrorKind::LostSheetLoops
        )
    }

    /// Exact-or-superclass match against a catch family name.
    pub fn is_a(self, family: &str) -> bool {
        match family {
            "Exception" | "BaseException" => true,
            "Knit_Script_Exception" => self.is_knit_script_specific(),
            "Gauge_Sheet_Exception" => self.is_gauge_sheet(),
            "LookupError" => matches!(self, ErrorKind::Index | ErrorKind::Key),
            "ArithmeticError" => self == ErrorKind::ZeroDivision,
            "AssertionError" => self == ErrorKind::Assertion,
            "OSError" => self == ErrorKind::Io,
            _ => self.family_name() == family,
        }
    }

    /// True when `name` names a catchable family.
    pub fn is_family(name: &str) -> bool {
        matches!(
            name,
            "Exception"
                | "BaseException"
                | "Knit_Script_Exception"
                | "Gauge_Sheet_Exception"
                | "LookupError"
                | "ArithmeticError"
                | "AssertionError"
                | "OSError"
        ) || ErrorKind::ALL.iter().any(|k| k.family_name() == name)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family_name())
    }
}

/// Runtime error raised while interpreting a pattern or executing knitout.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}{}", line_suffix(.line))]
pub struct KnitError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Option<Span>,
    pub line: Option<usize>,
}

#[allow(clippy::ref_option)]
fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" (line {l})")).unwrap_or_default()
}

impl KnitError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
            line: None,
        }
    }

    pub fn knitting(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Knitting, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn name(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Name, message)
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Attribute, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key, message)
    }

    /// Attach a source location unless one is already recorded. The innermost
    /// location wins.
    pub fn at(mut self, span: Span, line: usize) -> Self {
        if self.span.is_none() {
            self.span = Some(span);
            self.line = Some(line);
        }
        self
    }

    /// Attach a line number with no span, as for knitout input.
    pub fn on_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

impl From<std::io::Error> for KnitError {
    fn from(e: std::io::Error) -> Self {
        KnitError::new(ErrorKind::Io, e.to_string())
    }
}

impl From<serde_json::Error> for KnitError {
    fn from(e: serde_json::Error) -> Self {
        KnitError::new(ErrorKind::Config, e.to_string())
    }
}

/// Non-fatal diagnostics. Emitted through `tracing` and never stop execution.
#[derive(Debug, Clone, PartialEq)]
pub enum KnitWarning {
    ShadowVariable { name: String },
    SheetBeyondGauge { sheet: i64, gauge: i64 },
    KnitOnEmptyNeedle { needle: String },
    SplitOnEmptyNeedle { needle: String },
    ReleasehookUnhooked { carriers: String },
    InActiveCarrier { carrier: u32 },
    OutInactiveCarrier { carrier: u32 },
    LooseYarn { carrier: u32 },
}

impl KnitWarning {
    pub fn name(&self) -> &'static str {
        match self {
            KnitWarning::ShadowVariable { .. } => "Shadow_Variable",
            KnitWarning::SheetBeyondGauge { .. } => "Sheet_Beyond_Gauge",
            KnitWarning::KnitOnEmptyNeedle { .. } => "Knit_on_Empty_Needle",
            KnitWarning::SplitOnEmptyNeedle { .. } => "Split_on_Empty_Needle",
            KnitWarning::ReleasehookUnhooked { .. }
            | KnitWarning::InActiveCarrier { .. }
            | KnitWarning::OutInactiveCarrier { .. }
            | KnitWarning::LooseYarn { .. } => "Yarn_Carrier_State",
        }
    }

    pub fn emit(&self) {
        tracing::warn!(warning = self.name(), "{self}");
    }
}

impl fmt::Display for KnitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnitWarning::ShadowVariable { name } => {
                write!(f, "variable {name} shadows an outer binding")
            }
            KnitWarning::SheetBeyondGauge { sheet, gauge } => {
                write!(f, "sheet {sheet} is beyond gauge {gauge}; clipped to {}", gauge - 1)
            }
            KnitWarning::KnitOnEmptyNeedle { needle } => write!(f, "knitting on empty needle {needle}"),
            KnitWarning::SplitOnEmptyNeedle { needle } => write!(f, "splitting empty needle {needle}"),
            KnitWarning::ReleasehookUnhooked { carriers } => {
                write!(f, "cannot releasehook {carriers}: not on the inserting hook")
            }
            KnitWarning::InActiveCarrier { carrier } => {
                write!(f, "cannot bring in {carrier} because it is already active")
            }
            KnitWarning::OutInactiveCarrier { carrier } => {
                write!(f, "cannot bring out {carrier} because it is not active")
            }
            KnitWarning::LooseYarn { carrier } => {
                write!(f, "yarn on carrier {carrier} is loose; use inhook {carrier}")
            }
        }
    }
}
