//! Tree-walking interpreter: runs a parsed pattern against a virtual
//! knitting machine and collects the knitout it produces.

#[allow(clippy::needless_pass_by_value, clippy::too_many_arguments)]
pub mod builtins;
pub mod context;
#[allow(clippy::needless_pass_by_value)]
pub mod eval;
pub mod exec;
pub mod modules;
pub mod scope;
pub mod value;

use std::path::{Path, PathBuf};
use std::rc::Rc;

use indexmap::IndexMap;

pub use context::Context;
pub use exec::Flow;
pub use value::{Source, Value};

use crate::dsl::ast::Program;
use crate::error::{ErrorKind, KnitError};
use crate::knit_graph::KnitGraph;
use crate::knitout::{cut_all_yarns, header, render, KnitoutLine};
use crate::machine::KnittingMachine;
use crate::paths;
use crate::settings::InterpreterSettings;

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Header, pattern output and the closing outhooks.
    pub lines: Vec<KnitoutLine>,
    pub knit_graph: KnitGraph,
    pub machine: KnittingMachine,
    /// Value of a top-level `return`, if the pattern returned one.
    pub return_value: Option<Value>,
}

impl RunResult {
    pub fn knitout(&self) -> String {
        render(&self.lines)
    }
}

/// A failed run: the error plus the knitout produced before it.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub error: KnitError,
    pub partial: Vec<KnitoutLine>,
}

pub struct KnitScriptInterpreter {
    settings: InterpreterSettings,
}

impl KnitScriptInterpreter {
    pub fn new(settings: InterpreterSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &InterpreterSettings {
        &self.settings
    }

    /// Parse without running.
    pub fn parse(&self, pattern: &str) -> Result<Program, KnitError> {
        exec::parse_program(pattern)
    }

    /// Run pattern text in memory. `dir` is searched first by `import`.
    pub fn interpret(
        &self,
        pattern: &str,
        dir: Option<PathBuf>,
        host_vars: IndexMap<String, Value>,
    ) -> Result<RunResult, KnitError> {
        let source = Source::new("<pattern>", pattern, dir);
        self.run(source, host_vars).map_err(|f| f.error)
    }

    /// Run a pattern (file path or source text) and write its knitout to
    /// `out_path`. On failure the partial knitout and the error go to the
    /// error file next to `out_path` instead.
    pub fn write_knitout(
        &self,
        pattern: &str,
        out_path: &Path,
        pattern_is_file: bool,
        host_vars: IndexMap<String, Value>,
    ) -> Result<RunResult, KnitError> {
        let source = if pattern_is_file {
            let path = Path::new(pattern);
            let text = std::fs::read_to_string(path).map_err(|e| {
                KnitError::new(ErrorKind::Io, format!("cannot read pattern {pattern}: {e}"))
            })?;
            Source::new(pattern, text, path.parent().map(Path::to_path_buf))
        } else {
            Source::new("<pattern>", pattern, std::env::current_dir().ok())
        };
        match self.run(source, host_vars) {
            Ok(result) => {
                std::fs::write(out_path, result.knitout())?;
                tracing::info!(
                    path = %out_path.display(),
                    lines = result.lines.len(),
                    "wrote knitout"
                );
                Ok(result)
            }
            Err(RunFailure { error, mut partial }) => {
                for line in error.to_string().lines() {
                    partial.push(KnitoutLine::comment(format!("Error: {line}")));
                }
                let error_path = paths::error_path(out_path, &self.settings.error_file);
                if let Err(io) = std::fs::write(&error_path, render(&partial)) {
                    tracing::error!(path = %error_path.display(), "could not write error file: {io}");
                } else {
                    tracing::error!(path = %error_path.display(), "{error}");
                }
                Err(error)
            }
        }
    }

    fn run(&self, source: Rc<Source>, host_vars: IndexMap<String, Value>) -> Result<RunResult, RunFailure> {
        let spec = self.settings.machine.clone();
        let head = header(&spec);
        let fail = |error: KnitError, body: Vec<KnitoutLine>| {
            let mut partial = head.clone();
            partial.extend(body);
            RunFailure { error, partial }
        };
        let program = exec::parse_program(&source.text).map_err(|e| fail(e, Vec::new()))?;
        let mut ctx = Context::new(spec.clone(), self.settings.import_paths.clone(), source)
            .map_err(|e| fail(e, Vec::new()))?;
        let outcome = run_program(&mut ctx, &program, host_vars);
        if let Err(e) = outcome {
            return Err(fail(e, std::mem::take(&mut ctx.knitout)));
        }
        let mut lines = head;
        lines.append(&mut ctx.knitout);
        Ok(RunResult {
            lines,
            knit_graph: ctx.machine.knit_graph.clone(),
            machine: ctx.machine,
            return_value: ctx.exit_value,
        })
    }
}

fn run_program(ctx: &mut Context, program: &Program, host_vars: IndexMap<String, Value>) -> Result<(), KnitError> {
    for (name, value) in host_vars {
        ctx.assign(&name, value)?;
    }
    for stmt in &program.statements {
        if let Flow::Return(v) = ctx.exec(stmt)? {
            ctx.exit_value = Some(v);
            break;
        }
    }
    let closing = cut_all_yarns(&mut ctx.machine)?;
    ctx.knitout.extend(closing);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::settings::MachineSpec;

    fn interpreter() -> KnitScriptInterpreter {
        KnitScriptInterpreter::new(InterpreterSettings {
            machine: MachineSpec {
                width: 20,
                ..MachineSpec::default()
            },
            ..InterpreterSettings::default()
        })
    }

    fn run(src: &str) -> RunResult {
        interpreter().interpret(src, None, IndexMap::new()).unwrap()
    }

    fn run_err(src: &str) -> KnitError {
        interpreter().interpret(src, None, IndexMap::new()).unwrap_err()
    }

    /// Instruction lines after the header, without comments.
    fn body(result: &RunResult) -> Vec<String> {
        result
            .lines
            .iter()
            .filter_map(|l| l.instruction.as_ref())
            .filter(|i| {
                !matches!(
                    i,
                    crate::knitout::Instruction::Version(_) | crate::knitout::Instruction::Header(_)
                )
            })
            .map(ToString::to_string)
            .collect()
    }

    fn returned(result: &RunResult) -> String {
        result.return_value.as_ref().unwrap().to_string()
    }

    #[test]
    fn top_level_return_carries_a_value() {
        let r = run("x = 2 ^ 10; return x + 1;");
        assert_eq!(returned(&r), "1025");
    }

    #[test]
    fn functions_bind_defaults_and_keywords() {
        let r = run(
            "def f(a, b = 10, c = 100): { return a + b + c; }\n\
             return [f(1), f(1, 2), f(1, c = 3)];",
        );
        assert_eq!(returned(&r), "[111, 103, 14]");
    }

    #[test]
    fn closures_see_their_defining_scope() {
        let r = run(
            "def outer(): {\n\
               base = 5;\n\
               def inner(x): { return base + x; }\n\
               return inner;\n\
             }\n\
             g = outer();\n\
             return g(1);",
        );
        assert_eq!(returned(&r), "6");
    }

    #[test]
    fn runaway_recursion_is_an_error() {
        // Unoptimized builds need more than the default test-thread stack.
        let (kind, line) = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| {
                let e = run_err("def f(n): { return f(n + 1); }\nf(0);");
                (e.kind, e.line)
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(kind, ErrorKind::Value);
        assert_eq!(line, Some(1));
    }

    #[test]
    fn comprehensions_and_slices() {
        let r = run("xs = [i * i for i in range(6) if i % 2 == 0]; return xs[::-1];");
        assert_eq!(returned(&r), "[16, 4, 0]");
        let r = run("d = {k: v for k, v in zip(['a', 'b'], [1, 2])}; return d['b'];");
        assert_eq!(returned(&r), "2");
    }

    #[test]
    fn try_catches_by_family() {
        let r = run(
            "x = None;\n\
             try: { x = [1][5]; } catch LookupError as e: { x = e.kind; }\n\
             return x;",
        );
        assert_eq!(returned(&r), "IndexError");
        let e = run_err("try: { x = 1 / 0; } catch KeyError: { x = 0; }");
        assert_eq!(e.kind, ErrorKind::ZeroDivision);
    }

    #[test]
    fn with_restores_racking() {
        let r = run("with Racking as 1: { pause; }\nreturn Racking;");
        assert_eq!(body(&r), ["rack 1", "pause", "rack 0"]);
        assert_eq!(returned(&r), "0.0");
    }

    #[test]
    fn print_leaves_a_comment() {
        let r = run("print f\"row {1 + 1}\";");
        assert!(r.lines.iter().any(|l| l.to_string() == ";print: row 2"));
    }

    #[test]
    fn cast_on_and_knit() {
        let r = run(
            "Carrier = c1;\n\
             in Leftward direction: { tuck Front_Needles[1:5:2]; }\n\
             in Rightward direction: { tuck Front_Needles[0:5:2]; }\n\
             releasehook;\n\
             in reverse direction: { knit Loops; }",
        );
        assert_eq!(
            body(&r),
            [
                "inhook 1",
                "tuck - f3 1",
                "tuck - f1 1",
                "tuck + f0 1",
                "tuck + f2 1",
                "tuck + f4 1",
                "releasehook 1",
                "knit - f4 1",
                "knit - f3 1",
                "knit - f2 1",
                "knit - f1 1",
                "knit - f0 1",
                "outhook 1",
            ]
        );
    }

    #[test]
    fn knitting_without_a_carrier_fails() {
        let e = run_err("in Leftward direction: { knit f1; }");
        assert_eq!(e.kind, ErrorKind::NoDeclaredCarrier);
    }

    #[test]
    fn native_modules_import() {
        let r = run("import math; return math.floor(math.sqrt(17));");
        assert_eq!(returned(&r), "4");
        let r = run("import math as m; return m.pi > 3;");
        assert_eq!(returned(&r), "True");
        assert_eq!(run_err("import nowhere;").kind, ErrorKind::Import);
    }

    #[test]
    fn needle_arithmetic_respects_gauge() {
        let r = run("Gauge = 2; n = f1 + 1; return [n, n.position, n.sheet_position, n - f0];");
        assert_eq!(returned(&r), "[f4, 4, 2, 2]");
    }

    #[test]
    fn host_variables_seed_the_root_scope() {
        let mut vars = IndexMap::new();
        vars.insert("rows".to_string(), Value::Int(3));
        let r = interpreter()
            .interpret("return rows * 2;", None, vars)
            .unwrap();
        assert_eq!(returned(&r), "6");
    }

    #[test]
    fn failures_write_the_error_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pattern.k");
        let err = interpreter()
            .write_knitout("pause;\nassert False, \"stop\";", &out, false, IndexMap::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Assertion);
        assert!(!out.exists());
        let text = std::fs::read_to_string(dir.path().join("error.k")).unwrap();
        assert!(text.starts_with(";!knitout-2\n"));
        assert!(text.contains("\npause\n"));
        assert!(text.contains(";Error: Knit_Script_Assertion: stop (line 2)"));
    }

    #[test]
    fn oversized_values_are_errors() {
        assert_eq!(run_err("x = [1, 2] * 9223372036854775807;").kind, ErrorKind::Value);
        assert_eq!(run_err("x = \"ab\" * 9223372036854775807;").kind, ErrorKind::Value);
        assert_eq!(run_err("Gauge = 2; x = f1 + 2000000000;").kind, ErrorKind::Value);
        assert_eq!(run_err("x = f1 - 2147483648;").kind, ErrorKind::Value);
        assert_eq!(run_err("Gauge = 2; x = f2000000000;").kind, ErrorKind::Value);
        let r = run("return [[0] * 3, \"ab\" * 2, [] * 9223372036854775807];");
        assert_eq!(returned(&r), "[[0, 0, 0], 'abab', []]");
    }

    #[test]
    fn non_ascii_source_runs() {
        let r = run("/* café */ x = \"\\é\"; return x;");
        assert_eq!(returned(&r), "\\é");
    }

    #[test]
    fn knit_script_family_catches_machine_errors() {
        let r = run(
            "x = None;\n\
             try: { in Leftward direction: { knit f1; } }\n\
             catch Knit_Script_Exception as e: { x = e.kind; }\n\
             return x;",
        );
        assert_eq!(returned(&r), "No_Declared_Carrier");
        let e = run_err("try: { x = [][1]; } catch Knit_Script_Exception: { x = 0; }");
        assert_eq!(e.kind, ErrorKind::Index);
    }

    #[test]
    fn gauge_sheet_family_catches_sheet_errors() {
        let r = run(
            "kinds = [];\n\
             try: { Gauge = 0; } catch Gauge_Sheet_Exception as e: { kinds.append(e.kind); }\n\
             try: { Sheet = -1; } catch Gauge_Sheet_Exception as e: { kinds.append(e.kind); }\n\
             return [kinds, Gauge];",
        );
        assert_eq!(returned(&r), "[['Gauge_Value', 'Sheet_Value'], 1]");
        let e = run_err("try: { in Leftward direction: { knit f1; } } catch Gauge_Sheet_Exception: { pause; }");
        assert_eq!(e.kind, ErrorKind::NoDeclaredCarrier);
    }

    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `src` and return what it logged at warn level.
    fn warnings(src: &str) -> (RunResult, String) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || Capture(Arc::clone(&sink)))
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, || run(src));
        let text = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        (result, text)
    }

    #[test]
    fn shadowing_an_outer_variable_warns() {
        let (r, log) = warnings("x = 1;\ndef f(): { x = 2; return x; }\nreturn [f(), x];");
        assert_eq!(returned(&r), "[2, 1]");
        assert!(log.contains("Shadow_Variable"), "{log}");
        assert!(log.contains("variable x shadows an outer binding"), "{log}");

        let (_, log) = warnings("x = 1;\nx = 2;");
        assert!(!log.contains("Shadow_Variable"), "{log}");
    }

    #[test]
    fn sheet_past_the_gauge_is_clipped_with_a_warning() {
        let (r, log) = warnings("Gauge = 2;\nSheet = 5;\nreturn Sheet;");
        assert_eq!(returned(&r), "s1:g2");
        assert!(log.contains("Sheet_Beyond_Gauge"), "{log}");

        let (r, log) = warnings("Gauge = 3;\nSheet = 2;\nGauge = 2;\nreturn Sheet;");
        assert_eq!(returned(&r), "s1:g2");
        assert!(log.contains("sheet 2 is beyond gauge 2; clipped to 1"), "{log}");
    }
}
