// src/evaluator/mod.rs — Judge response evaluation

pub mod parser;

pub use parser::{parse_judgment, ParsedJudgment};
