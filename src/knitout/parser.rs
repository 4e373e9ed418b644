//! Reads canonical knitout text back into `KnitoutLine`s.

use std::fmt;

use crate::error::{ErrorKind, KnitError};
use crate::machine::{CarrierSet, Direction, KnittingMachine, Needle};

use super::{HeaderDeclaration, Instruction, KnitoutLine, NeedleInstruction, NeedleOp};

/// A parsed knitout stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnitoutProgram {
    pub lines: Vec<KnitoutLine>,
    trailing_newline: bool,
}

impl KnitoutProgram {
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.lines.iter().filter_map(|l| l.instruction.as_ref())
    }

    /// Replay every instruction against `machine`.
    pub fn execute(&self, machine: &mut KnittingMachine) -> Result<(), KnitError> {
        for line in &self.lines {
            let result = line.execute(machine);
            match (result, line.original_line) {
                (Err(e), Some(n)) => return Err(e.on_line(n)),
                (Err(e), None) => return Err(e),
                (Ok(()), _) => {}
            }
        }
        Ok(())
    }
}

impl fmt::Display for KnitoutProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for line in &self.lines {
            if !first {
                f.write_str("\n")?;
            }
            write!(f, "{line}")?;
            first = false;
        }
        if self.trailing_newline {
            f.write_str("\n")?;
        }
        Ok(())
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> KnitError {
    KnitError::new(ErrorKind::Parsing, message).on_line(line)
}

pub fn parse_knitout(text: &str) -> Result<KnitoutProgram, KnitError> {
    let mut program = KnitoutProgram {
        lines: Vec::new(),
        trailing_newline: text.ends_with('\n'),
    };
    let body = text.strip_suffix('\n').unwrap_or(text);
    if body.is_empty() && !program.trailing_newline {
        return Ok(program);
    }
    for (i, raw) in body.split('\n').enumerate() {
        let number = i + 1;
        let mut line = parse_line(raw, number)?;
        line.original_line = Some(number);
        // Comment-only lines ride along with the instruction above them.
        if line.is_comment() && line.comment.is_some() {
            if let Some(prev) = program.lines.last_mut() {
                if prev.instruction.is_some() {
                    if let Some(c) = line.comment.take() {
                        prev.follow_comments.push(c);
                    }
                    continue;
                }
            }
        }
        program.lines.push(line);
    }
    Ok(program)
}

fn parse_line(raw: &str, number: usize) -> Result<KnitoutLine, KnitError> {
    if let Some(version) = raw.strip_prefix(";!knitout-") {
        let v = version
            .trim()
            .parse()
            .map_err(|_| parse_error(number, format!("bad knitout version '{version}'")))?;
        return Ok(KnitoutLine::new(Instruction::Version(v)));
    }
    if let Some(header) = raw.strip_prefix(";;") {
        if let Some((key, value)) = header.split_once(": ") {
            let decl = parse_header(key, value, number)?;
            return Ok(KnitoutLine::new(Instruction::Header(decl)));
        }
    }
    if let Some(comment) = raw.strip_prefix(';') {
        return Ok(KnitoutLine::comment(comment));
    }
    if raw.is_empty() {
        return Ok(KnitoutLine {
            instruction: None,
            comment: None,
            follow_comments: Vec::new(),
            original_line: None,
        });
    }
    let (body, comment) = match raw.split_once(';') {
        Some((b, c)) => (b.trim_end(), Some(c.to_string())),
        None => (raw.trim_end(), None),
    };
    let mut line = KnitoutLine::new(parse_instruction(body, number)?);
    line.comment = comment;
    Ok(line)
}

fn parse_header(key: &str, value: &str, number: usize) -> Result<HeaderDeclaration, KnitError> {
    let decl = match key {
        "Machine" => HeaderDeclaration::Machine(value.to_string()),
        "Carriers" => {
            let ids = CarrierSet::parse(value)
                .ok_or_else(|| parse_error(number, format!("bad carrier list '{value}'")))?;
            let n = ids.len() as u32;
            if ids.ids().iter().copied().ne(1..=n) {
                return Ok(HeaderDeclaration::Other {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
            HeaderDeclaration::Carriers(n)
        }
        "Gauge" => HeaderDeclaration::Gauge(parse_number(value, number)?),
        "Width" => HeaderDeclaration::Width(parse_number(value, number)?),
        "Position" => HeaderDeclaration::Position(value.to_string()),
        _ => {
            if let Some(carrier) = key.strip_prefix("Yarn-") {
                if let Some(yarn) = parse_yarn(carrier, value) {
                    return Ok(yarn);
                }
            }
            match key.strip_prefix("X-") {
                Some(name) => HeaderDeclaration::Extension {
                    name: name.to_string(),
                    value: value.to_string(),
                },
                None => HeaderDeclaration::Other {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            }
        }
    };
    Ok(decl)
}

fn parse_yarn(carrier: &str, value: &str) -> Option<HeaderDeclaration> {
    let (weight, color) = value.split_once(' ')?;
    let (size, plies) = weight.split_once('-')?;
    Some(HeaderDeclaration::Yarn {
        carrier: carrier.parse().ok()?,
        size: size.parse().ok()?,
        plies: plies.parse().ok()?,
        color: color.to_string(),
    })
}

fn parse_number<T: std::str::FromStr>(text: &str, number: usize) -> Result<T, KnitError> {
    text.trim()
        .parse()
        .map_err(|_| parse_error(number, format!("expected a number, got '{text}'")))
}

fn parse_needle(text: Option<&&str>, number: usize) -> Result<Needle, KnitError> {
    let text = text.ok_or_else(|| parse_error(number, "missing needle"))?;
    Needle::parse(text).ok_or_else(|| parse_error(number, format!("bad needle '{text}'")))
}

fn parse_direction(text: Option<&&str>, number: usize) -> Result<Direction, KnitError> {
    let text = text.ok_or_else(|| parse_error(number, "missing direction"))?;
    Direction::from_symbol(text).ok_or_else(|| parse_error(number, format!("bad direction '{text}'")))
}

fn parse_carriers(words: &[&str], number: usize) -> Result<Option<CarrierSet>, KnitError> {
    if words.is_empty() {
        return Ok(None);
    }
    CarrierSet::parse(&words.join(" "))
        .map(Some)
        .ok_or_else(|| parse_error(number, format!("bad carrier set '{}'", words.join(" "))))
}

fn required_carriers(words: &[&str], number: usize) -> Result<CarrierSet, KnitError> {
    parse_carriers(words, number)?.ok_or_else(|| parse_error(number, "missing carrier set"))
}

fn parse_instruction(body: &str, number: usize) -> Result<Instruction, KnitError> {
    let words: Vec<&str> = body.split_whitespace().collect();
    let Some((op, args)) = words.split_first() else {
        return Err(parse_error(number, "empty instruction"));
    };
    let instruction = match *op {
        "rack" => Instruction::Rack(parse_number(args.first().copied().unwrap_or(""), number)?),
        "stitch" => match args {
            [l, t] => Instruction::Stitch {
                length: parse_number(l, number)?,
                tension: parse_number(t, number)?,
            },
            _ => return Err(parse_error(number, "stitch takes a length and a tension")),
        },
        "pause" => Instruction::Pause,
        "in" => Instruction::In(required_carriers(args, number)?),
        "inhook" => Instruction::Inhook(required_carriers(args, number)?),
        "releasehook" => Instruction::Releasehook(required_carriers(args, number)?),
        "out" => Instruction::Out(required_carriers(args, number)?),
        "outhook" => Instruction::Outhook(required_carriers(args, number)?),
        other => {
            if let Some(name) = other.strip_prefix("x-") {
                return Ok(Instruction::Extension {
                    name: name.to_string(),
                    payload: args.join(" "),
                });
            }
            let op = NeedleOp::from_name(other)
                .ok_or_else(|| parse_error(number, format!("unknown instruction '{other}'")))?;
            Instruction::Needle(parse_needle_instruction(op, args, number)?)
        }
    };
    Ok(instruction)
}

fn parse_needle_instruction(
    op: NeedleOp,
    args: &[&str],
    number: usize,
) -> Result<NeedleInstruction, KnitError> {
    let mut ni = match op {
        NeedleOp::Knit | NeedleOp::Tuck | NeedleOp::Miss => NeedleInstruction {
            direction: Some(parse_direction(args.first(), number)?),
            carriers: parse_carriers(args.get(2..).unwrap_or_default(), number)?,
            ..NeedleInstruction::new(op, parse_needle(args.get(1), number)?)
        },
        NeedleOp::Split => NeedleInstruction {
            direction: Some(parse_direction(args.first(), number)?),
            needle_2: Some(parse_needle(args.get(2), number)?),
            carriers: parse_carriers(args.get(3..).unwrap_or_default(), number)?,
            ..NeedleInstruction::new(op, parse_needle(args.get(1), number)?)
        },
        NeedleOp::Xfer => NeedleInstruction {
            needle_2: Some(parse_needle(args.get(1), number)?),
            ..NeedleInstruction::new(op, parse_needle(args.first(), number)?)
        },
        NeedleOp::Drop | NeedleOp::Amiss => {
            NeedleInstruction::new(op, parse_needle(args.first(), number)?)
        }
    };
    let expected = match op {
        NeedleOp::Drop | NeedleOp::Amiss => Some(1),
        NeedleOp::Xfer => Some(2),
        _ => None,
    };
    if expected.is_some_and(|n| args.len() != n) {
        return Err(parse_error(number, format!("wrong operand count for {op}")));
    }
    if ni.carriers.as_ref().is_some_and(CarrierSet::is_empty) {
        ni.carriers = None;
    }
    Ok(ni)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::settings::MachineSpec;

    const SAMPLE: &str = ";!knitout-2
;;Carriers: 1 2 3 4 5 6 7 8 9 10
;;Machine: SWG091N2
;;Gauge: 15
;;Width: 540
;;Position: Right
;;Yarn-1: 30-2 white
inhook 1
tuck - f3 1
tuck - f1 1
tuck + f0 1
;print: cast on
releasehook 1
rack 0.25 ;All Needle racking at 0
knit - f1 1
knit - b1 1
rack 0 ;Reset rack from all_needle
xfer f0 b0
split + f1 b1 1
drop f1
outhook 1
";

    #[test]
    fn round_trip_is_exact() {
        let program = parse_knitout(SAMPLE).unwrap();
        assert_eq!(program.to_string(), SAMPLE);
    }

    #[test]
    fn comments_follow_instructions() {
        let program = parse_knitout(SAMPLE).unwrap();
        let tuck = program
            .lines
            .iter()
            .find(|l| l.follow_comments.len() == 1)
            .unwrap();
        assert_eq!(tuck.instruction.as_ref().unwrap().to_string(), "tuck + f0 1");
        assert_eq!(tuck.original_line, Some(11));
        let rack = program
            .instructions()
            .find(|i| matches!(i, Instruction::Rack(r) if *r > 0.0))
            .unwrap();
        assert_eq!(*rack, Instruction::Rack(0.25));
    }

    #[test]
    fn header_parses_yarn_and_carriers() {
        let program = parse_knitout(SAMPLE).unwrap();
        let headers: Vec<&HeaderDeclaration> = program
            .instructions()
            .filter_map(|i| match i {
                Instruction::Header(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(headers.first(), Some(&&HeaderDeclaration::Carriers(10)));
        assert!(headers.contains(&&HeaderDeclaration::Yarn {
            carrier: 1,
            size: 30,
            plies: 2,
            color: "white".into()
        }));
    }

    #[test]
    fn unknown_instruction_reports_line() {
        let err = parse_knitout(";!knitout-2\nwobble f1\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parsing);
        assert_eq!(err.line, Some(2));
        assert!(parse_knitout("xfer f1\n").is_err());
        assert!(parse_knitout("knit ? f1 1\n").is_err());
    }

    #[test]
    fn replay_on_machine() {
        let program = parse_knitout(SAMPLE).unwrap();
        let mut machine = KnittingMachine::new(MachineSpec::default());
        program.execute(&mut machine).unwrap();
        assert!(machine.has_loops(&Needle::front(3)));
        assert!(!machine.has_loops(&Needle::front(1)));
        assert_eq!(machine.loops(&Needle::back(1)).len(), 2);
        assert!(machine.has_loops(&Needle::back(0)));
        assert!(machine.carrier_system.active_carriers().is_empty());
    }

    #[test]
    fn replay_error_carries_line() {
        let program = parse_knitout("knit + f0 1\n").unwrap();
        let mut machine = KnittingMachine::new(MachineSpec::default());
        let err = program.execute(&mut machine).unwrap_err();
        assert_eq!(err.line, Some(1));
    }
}
