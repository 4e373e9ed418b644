#![allow(clippy::unwrap_used)]

use indexmap::IndexMap;

use knit_script::interpreter::Value;
use knit_script::knitout::parser::parse_knitout;
use knit_script::knitout::Instruction;
use knit_script::machine::{KnittingMachine, Needle};
use knit_script::{InterpreterSettings, KnitScriptInterpreter, MachineSpec, RunResult};

fn interpreter() -> KnitScriptInterpreter {
    KnitScriptInterpreter::new(InterpreterSettings {
        machine: MachineSpec {
            width: 40,
            ..MachineSpec::default()
        },
        ..InterpreterSettings::default()
    })
}

fn run_with(src: &str, vars: IndexMap<String, Value>) -> RunResult {
    interpreter().interpret(src, None, vars).unwrap()
}

fn run(src: &str) -> RunResult {
    run_with(src, IndexMap::new())
}

/// Instruction lines of the pattern body: no header, no comments.
fn body(result: &RunResult) -> Vec<String> {
    result
        .lines
        .iter()
        .filter_map(|l| l.instruction.as_ref())
        .filter(|i| !matches!(i, Instruction::Version(_) | Instruction::Header(_)))
        .map(ToString::to_string)
        .collect()
}

const CAST_ON_AND_STOCKINETTE: &str = "\
Carrier = carrier;
in Leftward direction: { tuck Front_Needles[1:width:2]; }
in Rightward direction: { tuck Front_Needles[0:width:2]; }
releasehook;
for row in range(height): {
    in reverse direction: { knit Loops; }
}
";

fn rectangle_vars() -> IndexMap<String, Value> {
    let mut vars = IndexMap::new();
    vars.insert("width".to_string(), Value::Int(5));
    vars.insert("height".to_string(), Value::Int(3));
    vars.insert("carrier".to_string(), Value::Int(1));
    vars
}

#[test]
fn cast_on_then_stockinette_rectangle() {
    let result = run_with(CAST_ON_AND_STOCKINETTE, rectangle_vars());
    let leftward: Vec<String> = (0..5).rev().map(|i| format!("knit - f{i} 1")).collect();
    let rightward: Vec<String> = (0..5).map(|i| format!("knit + f{i} 1")).collect();
    let mut expected: Vec<String> = [
        "inhook 1",
        "tuck - f3 1",
        "tuck - f1 1",
        "tuck + f0 1",
        "tuck + f2 1",
        "tuck + f4 1",
        "releasehook 1",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    expected.extend(leftward.iter().cloned());
    expected.extend(rightward);
    expected.extend(leftward);
    expected.push("outhook 1".to_string());
    assert_eq!(body(&result), expected);
    assert_eq!(result.knit_graph.loop_count(), 20);
}

#[test]
fn knitout_output_starts_with_the_header() {
    let result = run_with(CAST_ON_AND_STOCKINETTE, rectangle_vars());
    let text = result.knitout();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some(";!knitout-2"));
    assert!(text.contains(";;Machine: SWG091N2"));
    assert!(text.contains(";;Width: 40"));
    assert!(text.ends_with('\n'));
}

#[test]
fn one_by_one_rib_moves_alternate_loops_back() {
    let result = run(
        "Carrier = c1;\n\
         in Leftward direction: { tuck Front_Needles[1:4:2]; }\n\
         in Rightward direction: { tuck Front_Needles[0:4:2]; }\n\
         releasehook;\n\
         xfer Front_Needles[1:4:2] across;\n\
         in Leftward direction: { knit Loops; }",
    );
    let lines = body(&result);
    let knits: Vec<&str> = lines
        .iter()
        .map(String::as_str)
        .filter(|l| l.starts_with("knit") || l.starts_with("xfer"))
        .collect();
    assert_eq!(
        knits,
        [
            "xfer f3 b3",
            "xfer f1 b1",
            "knit - b3 1",
            "knit - f2 1",
            "knit - b1 1",
            "knit - f0 1",
        ]
    );
    assert!(result.machine.has_loops(&Needle::back(1)));
    assert!(!result.machine.has_loops(&Needle::front(1)));
}

#[test]
fn double_bed_pass_uses_all_needle_racking() {
    let result = run(
        "Carrier = c1;\n\
         in Leftward direction: { knit Front_Needles[0:2], Back_Needles[0:2]; }",
    );
    assert_eq!(
        body(&result),
        [
            "inhook 1",
            "rack 0.25",
            "knit - f1 1",
            "knit - b1 1",
            "knit - f0 1",
            "knit - b0 1",
            "rack 0",
            "releasehook 1",
            "outhook 1",
        ]
    );
}

#[test]
fn sheets_round_trip_without_losing_loops() {
    let result = run(
        "Carrier = c1;\n\
         Gauge = 2;\n\
         Sheet = 0;\n\
         in Leftward direction: { tuck Front_Needles[0:3]; }\n\
         Sheet = 1;\n\
         in Rightward direction: { tuck Front_Needles[0:3]; }\n\
         Sheet = 0;",
    );
    let tucks: Vec<String> = body(&result)
        .into_iter()
        .filter(|l| l.starts_with("tuck"))
        .collect();
    assert_eq!(
        tucks,
        [
            "tuck - f4 1",
            "tuck - f2 1",
            "tuck - f0 1",
            "tuck + f1 1",
            "tuck + f3 1",
            "tuck + f5 1",
        ]
    );
    for pos in [0, 2, 4] {
        assert_eq!(result.machine.loops(&Needle::front(pos)).len(), 1);
        assert!(!result.machine.has_loops(&Needle::back(pos)));
    }
    let held: usize = result
        .machine
        .all_loops()
        .iter()
        .map(|n| result.machine.loops(n).len())
        .sum();
    assert_eq!(held, 6);
}

#[test]
fn drop_follows_the_leftward_pass() {
    let result = run(
        "Carrier = c1;\n\
         in Rightward direction: { tuck Front_Needles[0:3]; }\n\
         releasehook;\n\
         in Leftward direction: { knit Loops; }\n\
         drop Loops;",
    );
    let lines = body(&result);
    let tail: Vec<&str> = lines.iter().rev().take(7).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        [
            "knit - f2 1",
            "knit - f1 1",
            "knit - f0 1",
            "drop f2",
            "drop f1",
            "drop f0",
            "outhook 1",
        ]
    );
    assert!(result.machine.all_loops().is_empty());
}

#[test]
fn second_carrier_releases_the_hook_first() {
    let result = run("Carrier = c1;\nCarrier = c2;");
    let lines = body(&result);
    assert_eq!(lines.get(0..3).unwrap(), ["inhook 1", "releasehook 1", "inhook 2"]);
    assert!(lines.contains(&"outhook 1".to_string()));
    assert!(lines.contains(&"outhook 2".to_string()));
}

#[test]
fn aligned_front_and_back_need_a_transient_rack() {
    let result = run("Carrier = c1;\nin Leftward direction: { knit f5, b5; }");
    assert_eq!(
        body(&result),
        [
            "inhook 1",
            "rack 0.25",
            "knit - f5 1",
            "knit - b5 1",
            "rack 0",
            "releasehook 1",
            "outhook 1",
        ]
    );

    let result = run("Carrier = c1;\nRacking = 1;\nin Leftward direction: { knit f5, b5; }");
    assert_eq!(
        body(&result),
        [
            "inhook 1",
            "rack 1",
            "knit - b5 1",
            "knit - f5 1",
            "releasehook 1",
            "outhook 1",
        ]
    );
}

#[test]
fn hook_is_held_by_at_most_one_carrier() {
    let result = run(
        "Carrier = c1;\n\
         in Rightward direction: { tuck Front_Needles[0:3]; }\n\
         Carrier = c2;\n\
         in Leftward direction: { knit Loops; }\n\
         Carrier = c3;",
    );
    let mut outstanding = 0_i32;
    for line in body(&result) {
        if line.starts_with("inhook") {
            outstanding += 1;
        } else if line.starts_with("releasehook") {
            outstanding -= 1;
        }
        assert!((0..=1).contains(&outstanding), "hook count {outstanding} after {line}");
    }
}

#[test]
fn runs_are_deterministic() {
    let first = run_with(CAST_ON_AND_STOCKINETTE, rectangle_vars()).knitout();
    let second = run_with(CAST_ON_AND_STOCKINETTE, rectangle_vars()).knitout();
    assert_eq!(first, second);
}

#[test]
fn knitout_round_trips_through_the_parser() {
    let result = run_with(CAST_ON_AND_STOCKINETTE, rectangle_vars());
    let text = result.knitout();
    let program = parse_knitout(&text).unwrap();
    assert_eq!(program.to_string(), text);

    let mut machine = KnittingMachine::new(result.machine.spec().clone());
    program.execute(&mut machine).unwrap();
    for pos in 0..5 {
        assert!(machine.has_loops(&Needle::front(pos)));
    }
}

#[test]
fn write_knitout_reads_pattern_files_and_imports_siblings() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("stitches.ks"),
        "def cast_on(n): {\n\
           in Leftward direction: { tuck Front_Needles[1:n:2]; }\n\
           in Rightward direction: { tuck Front_Needles[0:n:2]; }\n\
           releasehook;\n\
         }\n",
    )
    .unwrap();
    let pattern = dir.path().join("swatch.ks");
    std::fs::write(&pattern, "import stitches;\nCarrier = c1;\nstitches.cast_on(4);\n").unwrap();
    let out = dir.path().join("swatch.k");

    let result = interpreter()
        .write_knitout(pattern.to_str().unwrap(), &out, true, IndexMap::new())
        .unwrap();
    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written, result.knitout());
    assert!(written.contains("\ntuck + f2 1"));
    assert!(written.contains("\nreleasehook 1"));
}

#[test]
fn rib_with_loops_on_both_beds_knits_all_needle() {
    let result = run(
        "Carrier = c1;\n\
         in Leftward direction: { tuck Front_Needles[1:4:2]; }\n\
         in Rightward direction: { tuck Front_Needles[0:4:2]; }\n\
         releasehook;\n\
         xfer Front_Needles[1:4:2] across;\n\
         in Leftward direction: { knit Front_Needles[0:4], Back_Needles[0:4]; }",
    );
    let lines = body(&result);
    let start = lines.iter().position(|l| l == "rack 0.25").unwrap();
    assert_eq!(lines.get(start - 1).map(String::as_str), Some("xfer f1 b1"));
    assert_eq!(
        lines.get(start..start + 10).unwrap(),
        [
            "rack 0.25",
            "knit - f3 1",
            "knit - b3 1",
            "knit - f2 1",
            "knit - b2 1",
            "knit - f1 1",
            "knit - b1 1",
            "knit - f0 1",
            "knit - b0 1",
            "rack 0",
        ]
    );
}

/// Bed and racked position of a `knit` line at the given physical rack.
fn racked(line: &str, rack: f64) -> Option<(bool, f64)> {
    let needle = line.strip_prefix("knit ")?.split_whitespace().nth(1)?;
    let front = needle.starts_with('f');
    let pos: f64 = needle.get(1..)?.parse().ok()?;
    Some((front, if front { pos } else { pos + rack.floor() }))
}

#[test]
fn passes_are_ordered_by_racked_position() {
    let needles = "f3, f4, f6, f8, b3, b5, b6, b7";
    for rack in -2..=2 {
        for (direction, sign) in [("Leftward", -1.0), ("Rightward", 1.0)] {
            let src = format!(
                "Carrier = c1;\nRacking = {rack};\nin {direction} direction: {{ knit {needles}; }}"
            );
            let lines = body(&run(&src));
            let mut current = 0.0;
            let mut last_rack = 0.0;
            let mut previous: Option<(bool, f64)> = None;
            let mut knits = 0;
            for line in &lines {
                if let Some(r) = line.strip_prefix("rack ") {
                    current = r.parse().unwrap();
                    last_rack = current;
                    continue;
                }
                let Some((front, pos)) = racked(line, current) else {
                    continue;
                };
                knits += 1;
                if let Some((prev_front, prev_pos)) = previous {
                    let step = (pos - prev_pos) * sign;
                    let all_needle = current.fract() != 0.0 && prev_front != front;
                    assert!(
                        step > 0.0 || (step == 0.0 && all_needle),
                        "{line} out of order at rack {rack} going {direction}: {lines:?}"
                    );
                }
                previous = Some((front, pos));
            }
            assert_eq!(knits, 8);
            assert!((last_rack - f64::from(rack)).abs() < f64::EPSILON, "{lines:?}");
        }
    }
}

#[test]
fn with_sheet_returns_to_the_outer_sheet() {
    let result = run(
        "Carrier = c1;\n\
         Gauge = 2;\n\
         in Leftward direction: { tuck Front_Needles[0:3]; }\n\
         with Sheet as 1: {\n\
             in Rightward direction: { tuck Front_Needles[0:3]; }\n\
         }\n\
         return Sheet;",
    );
    assert_eq!(result.return_value.as_ref().unwrap().to_string(), "s0:g2");
    let moves: Vec<String> = body(&result)
        .into_iter()
        .filter(|l| l.starts_with("tuck +") || l.starts_with("xfer"))
        .collect();
    assert_eq!(
        moves,
        [
            "tuck + f1 1",
            "tuck + f3 1",
            "tuck + f5 1",
            "xfer f1 b1",
            "xfer f3 b3",
            "xfer f5 b5",
        ]
    );
    for pos in [1, 3, 5] {
        assert!(result.machine.has_loops(&Needle::back(pos)));
        assert!(!result.machine.has_loops(&Needle::front(pos)));
    }
}

#[test]
fn with_gauge_restores_gauge_and_sheet() {
    let result = run(
        "Carrier = c1;\n\
         with Gauge as 2, Sheet as 1: {\n\
             in Rightward direction: { tuck Front_Needles[0:3]; }\n\
         }\n\
         return [Gauge, Sheet];",
    );
    assert_eq!(result.return_value.as_ref().unwrap().to_string(), "[1, s0:g1]");
    let moves: Vec<String> = body(&result)
        .into_iter()
        .filter(|l| l.starts_with("tuck") || l.starts_with("xfer"))
        .collect();
    assert_eq!(
        moves,
        [
            "tuck + f1 1",
            "tuck + f3 1",
            "tuck + f5 1",
            "xfer f1 b1",
            "xfer f3 b3",
            "xfer f5 b5",
        ]
    );
}
