//! Rules engine using rhai scripting
//!
//! Lets users add their own scoring rules to the configuration. Each rule is
//! a script evaluated against the extracted marking. A script returns
//! points (integer or float), a message (string, zero points), a map
//! `#{ points: .., message: .. }`, or nothing.

use anyhow::{anyhow, Result};
use rhai::{Dynamic, Engine, Scope, AST};
use strsim::normalized_levenshtein;
use tracing::{debug, warn};

use crate::config::RuleDefinition;

/// Upper bound on script operations, so a runaway loop cannot hang an analysis
const MAX_OPERATIONS: u64 = 100_000;

/// Marking facts exposed to rule scripts
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub part_number: Option<String>,
    pub manufacturer: Option<String>,
    pub date_year: Option<i32>,
    pub date_week: Option<u32>,
    pub lot_code: Option<String>,
    pub has_catalog_match: bool,
    /// Mean fused line confidence (0.0 - 1.0)
    pub ocr_confidence: f32,
    /// Engine agreement (0.0 - 1.0)
    pub agreement: f32,
    /// All marking lines joined by newlines
    pub text: String,
}

/// Result of evaluating a rule
#[derive(Debug, Clone, PartialEq)]
pub struct RuleResult {
    /// Rule that produced the result
    pub rule_id: String,
    pub points: i32,
    pub message: Option<String>,
}

struct CompiledRule {
    definition: RuleDefinition,
    ast: AST,
}

/// Rules engine powered by rhai
pub struct RulesEngine {
    engine: Engine,
    rules: Vec<CompiledRule>,
}

impl RulesEngine {
    /// Create a new rules engine
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.register_fn("similarity", |a: &str, b: &str| normalized_levenshtein(a, b));

        Self {
            engine,
            rules: Vec::new(),
        }
    }

    /// Build an engine with every rule from the configuration
    pub fn from_definitions(definitions: &[RuleDefinition]) -> Result<Self> {
        let mut engine = Self::new();
        for definition in definitions {
            engine.register_rule(definition.clone())?;
        }
        Ok(engine)
    }

    /// Compile and register a rule, replacing any rule with the same id
    pub fn register_rule(&mut self, definition: RuleDefinition) -> Result<()> {
        let ast = self
            .engine
            .compile(&definition.script)
            .map_err(|e| anyhow!("Rule '{}' failed to compile: {}", definition.id, e))?;

        debug!("Registered rule '{}' ({})", definition.id, definition.name);
        self.rules.retain(|r| r.definition.id != definition.id);
        self.rules.push(CompiledRule { definition, ast });
        Ok(())
    }

    /// Number of registered rules, including disabled ones
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate all enabled rules against a marking
    pub fn evaluate(&self, context: &RuleContext) -> Vec<RuleResult> {
        let mut results = Vec::new();

        for rule in self.rules.iter().filter(|r| r.definition.enabled) {
            let mut scope = build_scope(context);
            match self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &rule.ast) {
                Ok(value) => {
                    if let Some(result) = interpret(&rule.definition.id, value) {
                        results.push(result);
                    }
                }
                Err(e) => warn!("Rule '{}' failed: {}", rule.definition.id, e),
            }
        }

        results
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn optional<T: Into<Dynamic>>(value: Option<T>) -> Dynamic {
    value.map(Into::into).unwrap_or(Dynamic::UNIT)
}

fn build_scope(context: &RuleContext) -> Scope<'static> {
    let mut scope = Scope::new();
    scope.push_dynamic("part_number", optional(context.part_number.clone()));
    scope.push_dynamic("manufacturer", optional(context.manufacturer.clone()));
    scope.push_dynamic("date_year", optional(context.date_year.map(i64::from)));
    scope.push_dynamic("date_week", optional(context.date_week.map(i64::from)));
    scope.push_dynamic("lot_code", optional(context.lot_code.clone()));
    scope.push("has_catalog_match", context.has_catalog_match);
    scope.push("ocr_confidence", context.ocr_confidence as f64);
    scope.push("agreement", context.agreement as f64);
    scope.push("text", context.text.clone());
    scope
}

fn points_of(value: &Dynamic) -> Option<i32> {
    if let Ok(i) = value.as_int() {
        return Some(i.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
    }
    value.as_float().ok().map(|f| f.round() as i32)
}

/// Turn a script's return value into a result
fn interpret(rule_id: &str, value: Dynamic) -> Option<RuleResult> {
    if value.is_unit() {
        return None;
    }

    let result = |points: i32, message: Option<String>| RuleResult {
        rule_id: rule_id.to_string(),
        points,
        message,
    };

    if let Some(points) = points_of(&value) {
        return Some(result(points, None));
    }
    if value.is_string() {
        return value.into_string().ok().map(|m| result(0, Some(m)));
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let points = map.get("points").and_then(points_of).unwrap_or(0);
        let message = map
            .get("message")
            .and_then(|m| m.clone().into_string().ok());
        return Some(result(points, message));
    }

    warn!("Rule '{}' returned unsupported value of type {}", rule_id, value.type_name());
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, script: &str) -> RuleDefinition {
        RuleDefinition {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            script: script.to_string(),
        }
    }

    fn context() -> RuleContext {
        RuleContext {
            part_number: Some("LM358N".to_string()),
            manufacturer: Some("Texas Instruments".to_string()),
            date_year: Some(2022),
            date_week: Some(31),
            lot_code: None,
            has_catalog_match: true,
            ocr_confidence: 0.9,
            agreement: 1.0,
            text: "LM358N\n2231\nTI".to_string(),
        }
    }

    #[test]
    fn test_integer_result() {
        let mut engine = RulesEngine::new();
        engine.register_rule(rule("bonus", "if date_year >= 2020 { 5 } else { 0 }")).unwrap();

        let results = engine.evaluate(&context());
        assert_eq!(results, vec![RuleResult { rule_id: "bonus".to_string(), points: 5, message: None }]);
    }

    #[test]
    fn test_map_and_string_results() {
        let mut engine = RulesEngine::new();
        engine
            .register_rule(rule(
                "old_stock",
                r#"if date_year < 2023 { #{ points: -5, message: "older than 2023" } }"#,
            ))
            .unwrap();
        engine.register_rule(rule("note", r#""checked " + part_number"#)).unwrap();

        let results = engine.evaluate(&context());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].points, -5);
        assert_eq!(results[0].message.as_deref(), Some("older than 2023"));
        assert_eq!(results[1].points, 0);
        assert_eq!(results[1].message.as_deref(), Some("checked LM358N"));
    }

    #[test]
    fn test_unit_result_skipped() {
        let mut engine = RulesEngine::new();
        engine.register_rule(rule("quiet", "if !has_catalog_match { -10 }")).unwrap();
        assert!(engine.evaluate(&context()).is_empty());
    }

    #[test]
    fn test_missing_fields_are_unit() {
        let mut engine = RulesEngine::new();
        engine.register_rule(rule("no_lot", r#"if type_of(lot_code) == "()" { -1 }"#)).unwrap();
        assert_eq!(engine.evaluate(&context())[0].points, -1);
    }

    #[test]
    fn test_float_points_rounded() {
        let mut engine = RulesEngine::new();
        engine.register_rule(rule("conf", "ocr_confidence * 10.0")).unwrap();
        assert_eq!(engine.evaluate(&context())[0].points, 9);
    }

    #[test]
    fn test_similarity_helper() {
        let mut engine = RulesEngine::new();
        engine
            .register_rule(rule("sim", r#"if similarity(part_number, "LM358N") > 0.99 { 3 }"#))
            .unwrap();
        assert_eq!(engine.evaluate(&context())[0].points, 3);
    }

    #[test]
    fn test_compile_error() {
        let mut engine = RulesEngine::new();
        let err = engine.register_rule(rule("broken", "if {")).unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_runtime_error_skipped() {
        let mut engine = RulesEngine::new();
        engine.register_rule(rule("bad", "part_number.len() + undefined_var")).unwrap();
        engine.register_rule(rule("good", "1")).unwrap();

        let results = engine.evaluate(&context());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id, "good");
    }

    #[test]
    fn test_runaway_script_stopped() {
        let mut engine = RulesEngine::new();
        engine.register_rule(rule("spin", "let n = 0; loop { n += 1; }")).unwrap();
        assert!(engine.evaluate(&context()).is_empty());
    }

    #[test]
    fn test_disabled_rule_skipped_and_replaced() {
        let mut engine = RulesEngine::new();
        let mut disabled = rule("r", "10");
        disabled.enabled = false;
        engine.register_rule(disabled).unwrap();
        assert!(engine.evaluate(&context()).is_empty());

        engine.register_rule(rule("r", "20")).unwrap();
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.evaluate(&context())[0].points, 20);
    }
}
