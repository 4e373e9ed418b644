//! Knitout instruction records: textual form plus execution against the
//! virtual machine.

pub mod parser;

use std::fmt;

use crate::error::KnitError;
use crate::machine::{CarrierSet, Direction, KnittingMachine, Needle};
use crate::settings::MachineSpec;

pub const KNITOUT_VERSION: u32 = 2;

/// Print a number the way knitout expects: integers without a fraction.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

// ── Needle operations ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeedleOp {
    Knit,
    Tuck,
    Miss,
    Split,
    Drop,
    Amiss,
    Xfer,
}

impl NeedleOp {
    pub fn name(self) -> &'static str {
        match self {
            NeedleOp::Knit => "knit",
            NeedleOp::Tuck => "tuck",
            NeedleOp::Miss => "miss",
            NeedleOp::Split => "split",
            NeedleOp::Drop => "drop",
            NeedleOp::Amiss => "amiss",
            NeedleOp::Xfer => "xfer",
        }
    }

    pub fn from_name(name: &str) -> Option<NeedleOp> {
        match name {
            "knit" => Some(NeedleOp::Knit),
            "tuck" => Some(NeedleOp::Tuck),
            "miss" => Some(NeedleOp::Miss),
            "split" => Some(NeedleOp::Split),
            "drop" => Some(NeedleOp::Drop),
            "amiss" => Some(NeedleOp::Amiss),
            "xfer" => Some(NeedleOp::Xfer),
            _ => None,
        }
    }

    /// Knit and tuck may share a pass and may run all-needle.
    pub fn in_knitting_pass(self) -> bool {
        matches!(self, NeedleOp::Knit | NeedleOp::Tuck)
    }

    pub fn all_needle_capable(self) -> bool {
        self.in_knitting_pass()
    }

    /// Needs a pass direction and a carrier set.
    pub fn directed(self) -> bool {
        matches!(
            self,
            NeedleOp::Knit | NeedleOp::Tuck | NeedleOp::Miss | NeedleOp::Split
        )
    }

    pub fn requires_second_needle(self) -> bool {
        matches!(self, NeedleOp::Xfer | NeedleOp::Split)
    }

    pub fn compatible_with(self, other: NeedleOp) -> bool {
        if self.in_knitting_pass() && other.in_knitting_pass() {
            return true;
        }
        self == other
    }
}

impl fmt::Display for NeedleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeedleInstruction {
    pub op: NeedleOp,
    pub direction: Option<Direction>,
    pub needle: Needle,
    pub needle_2: Option<Needle>,
    pub carriers: Option<CarrierSet>,
}

impl NeedleInstruction {
    pub fn new(op: NeedleOp, needle: Needle) -> Self {
        Self {
            op,
            direction: None,
            needle,
            needle_2: None,
            carriers: None,
        }
    }

    fn carriers_or_empty(&self) -> CarrierSet {
        self.carriers.clone().unwrap_or_else(|| CarrierSet::new([]))
    }

    fn require_second(&self) -> Result<Needle, KnitError> {
        self.needle_2
            .ok_or_else(|| KnitError::knitting(format!("{} needs a second needle", self.op)))
    }

    fn require_carriers(&self) -> Result<CarrierSet, KnitError> {
        match &self.carriers {
            Some(cs) if !cs.is_empty() => Ok(cs.clone()),
            _ => Err(KnitError::knitting(format!(
                "{} {} needs a carrier set",
                self.op, self.needle
            ))),
        }
    }

    fn execute(&self, machine: &mut KnittingMachine) -> Result<(), KnitError> {
        let text = self.to_string();
        if self.op.directed() && self.direction.is_none() {
            return Err(KnitError::knitting(format!("{text}: missing direction")));
        }
        match self.op {
            NeedleOp::Knit => {
                machine.knit(&self.needle, &self.require_carriers()?, &text)?;
            }
            NeedleOp::Tuck => {
                machine.tuck(&self.needle, &self.require_carriers()?, &text)?;
            }
            NeedleOp::Split => {
                let to = self.require_second()?;
                machine.split(&self.needle, &to, &self.carriers_or_empty(), &text)?;
            }
            NeedleOp::Miss => machine.miss(&self.needle, &self.require_carriers()?)?,
            NeedleOp::Drop => {
                machine.drop(&self.needle)?;
            }
            NeedleOp::Amiss => machine.check_needle(&self.needle)?,
            NeedleOp::Xfer => {
                let to = self.require_second()?;
                machine.xfer(&self.needle, &to, &text)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for NeedleInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op.name())?;
        if let Some(d) = self.direction {
            write!(f, " {}", d.symbol())?;
        }
        write!(f, " {}", self.needle)?;
        if let Some(n2) = self.needle_2 {
            write!(f, " {n2}")?;
        }
        if let Some(cs) = &self.carriers {
            if !cs.is_empty() {
                write!(f, " {cs}")?;
            }
        }
        Ok(())
    }
}

// ── Header ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderDeclaration {
    Machine(String),
    /// Number of carriers; printed as `1 2 ... N`.
    Carriers(u32),
    Gauge(u32),
    Width(i32),
    Position(String),
    Yarn {
        carrier: u32,
        size: u32,
        plies: u32,
        color: String,
    },
    Extension {
        name: String,
        value: String,
    },
    /// Any other `;;Key: value` line, kept verbatim.
    Other {
        key: String,
        value: String,
    },
}

impl fmt::Display for HeaderDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderDeclaration::Machine(m) => write!(f, ";;Machine: {m}"),
            HeaderDeclaration::Carriers(n) => {
                let ids = CarrierSet::new(1..=*n);
                write!(f, ";;Carriers: {ids}")
            }
            HeaderDeclaration::Gauge(g) => write!(f, ";;Gauge: {g}"),
            HeaderDeclaration::Width(w) => write!(f, ";;Width: {w}"),
            HeaderDeclaration::Position(p) => write!(f, ";;Position: {p}"),
            HeaderDeclaration::Yarn {
                carrier,
                size,
                plies,
                color,
            } => write!(f, ";;Yarn-{carrier}: {size}-{plies} {color}"),
            HeaderDeclaration::Extension { name, value } => write!(f, ";;X-{name}: {value}"),
            HeaderDeclaration::Other { key, value } => write!(f, ";;{key}: {value}"),
        }
    }
}

// ── Instructions ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Version(u32),
    Header(HeaderDeclaration),
    Rack(f64),
    Stitch { length: f64, tension: f64 },
    Pause,
    Extension { name: String, payload: String },
    In(CarrierSet),
    Inhook(CarrierSet),
    Releasehook(CarrierSet),
    Out(CarrierSet),
    Outhook(CarrierSet),
    Needle(NeedleInstruction),
}

impl Instruction {
    pub fn needle_op(op: NeedleOp, direction: Option<Direction>, needle: Needle) -> Self {
        Instruction::Needle(NeedleInstruction {
            direction,
            ..NeedleInstruction::new(op, needle)
        })
    }

    /// Apply the instruction's side effects to the machine.
    pub fn execute(&self, machine: &mut KnittingMachine) -> Result<(), KnitError> {
        match self {
            Instruction::Version(_)
            | Instruction::Header(_)
            | Instruction::Stitch { .. }
            | Instruction::Pause
            | Instruction::Extension { .. } => Ok(()),
            Instruction::Rack(r) => machine.set_racking(*r),
            Instruction::In(cs) => machine.bring_in(cs),
            Instruction::Inhook(cs) => machine.inhook(cs),
            Instruction::Releasehook(cs) => machine.releasehook(cs),
            Instruction::Out(cs) => machine.out(cs),
            Instruction::Outhook(cs) => machine.outhook(cs),
            Instruction::Needle(ni) => ni.execute(machine),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Version(v) => write!(f, ";!knitout-{v}"),
            Instruction::Header(h) => write!(f, "{h}"),
            Instruction::Rack(r) => write!(f, "rack {}", format_number(*r)),
            Instruction::Stitch { length, tension } => {
                write!(f, "stitch {} {}", format_number(*length), format_number(*tension))
            }
            Instruction::Pause => f.write_str("pause"),
            Instruction::Extension { name, payload } => {
                if payload.is_empty() {
                    write!(f, "x-{name}")
                } else {
                    write!(f, "x-{name} {payload}")
                }
            }
            Instruction::In(cs) => write!(f, "in {cs}"),
            Instruction::Inhook(cs) => write!(f, "inhook {cs}"),
            Instruction::Releasehook(cs) => write!(f, "releasehook {cs}"),
            Instruction::Out(cs) => write!(f, "out {cs}"),
            Instruction::Outhook(cs) => write!(f, "outhook {cs}"),
            Instruction::Needle(ni) => write!(f, "{ni}"),
        }
    }
}

// ── Lines ───────────────────────────────────────────────────────

/// One line of knitout output: an instruction, a comment, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct KnitoutLine {
    pub instruction: Option<Instruction>,
    pub comment: Option<String>,
    /// Comment-only lines that followed this one in parsed input.
    pub follow_comments: Vec<String>,
    /// Line number in the knitout this was parsed from.
    pub original_line: Option<usize>,
}

impl KnitoutLine {
    pub fn new(instruction: Instruction) -> Self {
        Self {
            instruction: Some(instruction),
            comment: None,
            follow_comments: Vec::new(),
            original_line: None,
        }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            instruction: None,
            comment: Some(text.into()),
            follow_comments: Vec::new(),
            original_line: None,
        }
    }

    pub fn with_comment(mut self, text: impl Into<String>) -> Self {
        self.comment = Some(text.into());
        self
    }

    pub fn is_comment(&self) -> bool {
        self.instruction.is_none()
    }

    pub fn execute(&self, machine: &mut KnittingMachine) -> Result<(), KnitError> {
        match &self.instruction {
            Some(i) => i.execute(machine),
            None => Ok(()),
        }
    }

    /// Build, execute, and return a line in one step.
    pub fn executed(
        instruction: Instruction,
        machine: &mut KnittingMachine,
        comment: Option<String>,
    ) -> Result<Self, KnitError> {
        instruction.execute(machine)?;
        let mut line = KnitoutLine::new(instruction);
        line.comment = comment;
        Ok(line)
    }
}

impl fmt::Display for KnitoutLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.instruction, &self.comment) {
            (Some(i), Some(c)) => write!(f, "{i} ;{c}")?,
            (Some(i), None) => write!(f, "{i}")?,
            (None, Some(c)) => write!(f, ";{c}")?,
            (None, None) => {}
        }
        for fc in &self.follow_comments {
            write!(f, "\n;{fc}")?;
        }
        Ok(())
    }
}

/// Version line and header declarations for a machine.
pub fn header(spec: &MachineSpec) -> Vec<KnitoutLine> {
    let mut lines = vec![
        KnitoutLine::new(Instruction::Version(KNITOUT_VERSION)),
        KnitoutLine::new(Instruction::Header(HeaderDeclaration::Carriers(spec.carrier_count))),
        KnitoutLine::new(Instruction::Header(HeaderDeclaration::Machine(spec.machine.to_string()))),
        KnitoutLine::new(Instruction::Header(HeaderDeclaration::Gauge(spec.header_gauge))),
        KnitoutLine::new(Instruction::Header(HeaderDeclaration::Width(spec.width))),
        KnitoutLine::new(Instruction::Header(HeaderDeclaration::Position(spec.position.to_string()))),
    ];
    for y in &spec.yarns {
        lines.push(KnitoutLine::new(Instruction::Header(HeaderDeclaration::Yarn {
            carrier: y.carrier,
            size: y.size,
            plies: y.plies,
            color: y.color.clone(),
        })));
    }
    lines
}

/// Release the hook if held, then outhook every active carrier.
pub fn cut_all_yarns(machine: &mut KnittingMachine) -> Result<Vec<KnitoutLine>, KnitError> {
    let mut lines = Vec::new();
    if let Some(hooked) = machine.carrier_system.hooked_carriers().cloned() {
        lines.push(KnitoutLine::executed(
            Instruction::Releasehook(hooked),
            machine,
            Some("Release inserting hook before cutting all yarns".to_string()),
        )?);
    }
    for id in machine.carrier_system.active_carriers().ids().to_vec() {
        lines.push(KnitoutLine::executed(
            Instruction::Outhook(CarrierSet::single(id)),
            machine,
            Some(format!("Cutting active yarn on {id}")),
        )?);
    }
    Ok(lines)
}

/// Join lines into knitout text, one per line with a trailing newline.
pub fn render(lines: &[KnitoutLine]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn knit(dir: Direction, needle: Needle, carrier: u32) -> Instruction {
        Instruction::Needle(NeedleInstruction {
            op: NeedleOp::Knit,
            direction: Some(dir),
            needle,
            needle_2: None,
            carriers: Some(CarrierSet::single(carrier)),
        })
    }

    #[test]
    fn instruction_text() {
        assert_eq!(knit(Direction::Leftward, Needle::front(3), 1).to_string(), "knit - f3 1");
        let xfer = Instruction::Needle(NeedleInstruction {
            needle_2: Some(Needle::back(1)),
            ..NeedleInstruction::new(NeedleOp::Xfer, Needle::front(1))
        });
        assert_eq!(xfer.to_string(), "xfer f1 b1");
        let split = Instruction::Needle(NeedleInstruction {
            op: NeedleOp::Split,
            direction: Some(Direction::Rightward),
            needle: Needle::front(2),
            needle_2: Some(Needle::slider(crate::machine::Bed::Back, 2)),
            carriers: Some(CarrierSet::new([1, 2])),
        });
        assert_eq!(split.to_string(), "split + f2 bs2 1 2");
        assert_eq!(Instruction::Rack(0.0).to_string(), "rack 0");
        assert_eq!(Instruction::Rack(-1.75).to_string(), "rack -1.75");
        assert_eq!(Instruction::Rack(0.25).to_string(), "rack 0.25");
        assert_eq!(
            Instruction::Stitch { length: 5.0, tension: 3.0 }.to_string(),
            "stitch 5 3"
        );
        assert_eq!(
            Instruction::Extension {
                name: "speed".into(),
                payload: "300".into()
            }
            .to_string(),
            "x-speed 300"
        );
    }

    #[test]
    fn line_comments() {
        let line = KnitoutLine::new(Instruction::Inhook(CarrierSet::single(1))).with_comment("hook");
        assert_eq!(line.to_string(), "inhook 1 ;hook");
        assert_eq!(KnitoutLine::comment("print: 5").to_string(), ";print: 5");
    }

    #[test]
    fn default_header() {
        let text = render(&header(&MachineSpec::default()));
        assert_eq!(
            text,
            ";!knitout-2\n;;Carriers: 1 2 3 4 5 6 7 8 9 10\n;;Machine: SWG091N2\n;;Gauge: 15\n;;Width: 540\n;;Position: Right\n"
        );
    }

    #[test]
    fn op_properties() {
        assert!(NeedleOp::Knit.compatible_with(NeedleOp::Tuck));
        assert!(!NeedleOp::Knit.compatible_with(NeedleOp::Xfer));
        assert!(NeedleOp::Xfer.compatible_with(NeedleOp::Xfer));
        assert!(!NeedleOp::Miss.compatible_with(NeedleOp::Knit));
        assert!(NeedleOp::Split.requires_second_needle());
        assert!(!NeedleOp::Xfer.directed());
        assert!(!NeedleOp::Split.all_needle_capable());
    }

    #[test]
    fn execute_updates_machine() {
        let mut m = KnittingMachine::new(MachineSpec::default());
        KnitoutLine::new(Instruction::Inhook(CarrierSet::single(1)))
            .execute(&mut m)
            .unwrap();
        knit(Direction::Rightward, Needle::front(0), 1).execute(&mut m).unwrap();
        assert!(m.has_loops(&Needle::front(0)));
        let undirected = Instruction::needle_op(NeedleOp::Knit, None, Needle::front(1));
        assert!(undirected.execute(&mut m).is_err());
    }

    #[test]
    fn cut_all_yarns_releases_then_outhooks() {
        let mut m = KnittingMachine::new(MachineSpec::default());
        Instruction::Inhook(CarrierSet::single(2)).execute(&mut m).unwrap();
        let lines = cut_all_yarns(&mut m).unwrap();
        let ops: Vec<String> = lines
            .iter()
            .map(|l| l.instruction.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(ops, ["releasehook 2", "outhook 2"]);
        assert!(m.carrier_system.active_carriers().is_empty());
    }
}
