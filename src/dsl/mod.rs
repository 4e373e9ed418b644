#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::single_match_else,
    clippy::module_name_repetitions,
)]
pub mod ast;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::module_name_repetitions,
)]
pub mod error;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::single_match_else,
    clippy::module_name_repetitions,
)]
pub mod lexer;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod parser;

use ast::Program;
use error::CompileError;

/// Parse KnitScript source into a statement tree.
///
/// source → lex → parse → `Program`
pub fn parse_source(source: &str) -> Result<Program, Vec<CompileError>> {
    let tokens = lexer::lex(source)?;
    parser::parse(tokens)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_cast_on() {
        let program = parse_source(
            "Carrier = c1;\n\
             in Leftward direction: { tuck Front_Needles[1:5:2]; }\n\
             releasehook;",
        )
        .unwrap();
        assert_eq!(program.statements.len(), 3);
    }

    #[test]
    fn lexer_errors_surface() {
        let errors = parse_source("x = \"open").unwrap_err();
        assert_eq!(errors[0].kind, error::ErrorKind::Lexer);
    }
}
