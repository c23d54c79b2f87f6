//! Deferred string values and their resolution into CloudFormation JSON.
//!
//! A [`TokenString`] is an ordered list of fragments: literal text,
//! intrinsic references (`Ref`, `Fn::GetAtt`, `Fn::ImportValue`), and
//! [`Lazy`] thunks whose `produce` closure runs only when the string is
//! materialized during template synthesis. Construction never evaluates a
//! lazy; every call to [`TokenString::resolve`] evaluates it again, so a lazy
//! always reflects the state of the graph at synthesis time.

use super::error::TokenError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Maximum nesting of lazies producing lazies.
pub const MAX_RESOLVE_DEPTH: usize = 32;

type Produce = dyn Fn() -> Result<TokenString, TokenError>;

/// A value computed on demand.
#[derive(Clone)]
pub struct Lazy {
    produce: Rc<Produce>,
}

impl Lazy {
    pub fn new(produce: impl Fn() -> Result<TokenString, TokenError> + 'static) -> Self {
        Self {
            produce: Rc::new(produce),
        }
    }

    /// Run the thunk.
    pub fn produce(&self) -> Result<TokenString, TokenError> {
        (self.produce)()
    }
}

impl fmt::Debug for Lazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lazy(..)")
    }
}

/// One piece of a token string.
#[derive(Debug, Clone)]
pub enum Fragment {
    Literal(String),
    /// `Ref` to a resource, parameter, or pseudo parameter (`AWS::Region`).
    Ref(String),
    GetAtt(String, String),
    ImportValue(String),
    Lazy(Lazy),
}

/// A string that may contain unresolved references.
#[derive(Debug, Clone, Default)]
pub struct TokenString {
    fragments: Vec<Fragment>,
}

/// Parameter values used while materializing tokens. The default context
/// supplies none, so every parameter stays a `Ref`.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    parameters: HashMap<String, String>,
}

impl ResolveContext {
    /// Supply concrete values for template parameters (deployment overrides).
    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parameter_value(&self, id: &str) -> Option<&str> {
        self.parameters.get(id).map(String::as_str)
    }
}

enum Part {
    Text(String),
    Intrinsic(Value),
}

impl TokenString {
    pub fn literal(s: impl Into<String>) -> Self {
        Self {
            fragments: vec![Fragment::Literal(s.into())],
        }
    }

    pub fn reference(logical_id: impl Into<String>) -> Self {
        Self {
            fragments: vec![Fragment::Ref(logical_id.into())],
        }
    }

    pub fn get_att(logical_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            fragments: vec![Fragment::GetAtt(logical_id.into(), attribute.into())],
        }
    }

    pub fn import_value(export_name: impl Into<String>) -> Self {
        Self {
            fragments: vec![Fragment::ImportValue(export_name.into())],
        }
    }

    /// A string whose content is produced at materialization time.
    pub fn lazy(produce: impl Fn() -> Result<TokenString, TokenError> + 'static) -> Self {
        Self {
            fragments: vec![Fragment::Lazy(Lazy::new(produce))],
        }
    }

    /// Append another token string (or plain text).
    pub fn push(mut self, other: impl Into<TokenString>) -> Self {
        self.fragments.extend(other.into().fragments);
        self
    }

    pub fn concat<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = TokenString>,
    {
        parts.into_iter().fold(Self::default(), |acc, p| acc.push(p))
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// The plain text, if every fragment is a literal. Never forces a lazy.
    pub fn as_literal(&self) -> Option<String> {
        let mut out = String::new();
        for f in &self.fragments {
            match f {
                Fragment::Literal(s) => out.push_str(s),
                _ => return None,
            }
        }
        Some(out)
    }

    /// Materialize into a CloudFormation value: a plain string when fully
    /// literal, the intrinsic itself when it is the only part, otherwise
    /// `Fn::Join` with an empty delimiter.
    pub fn resolve(&self, ctx: &ResolveContext) -> Result<Value, TokenError> {
        let mut parts = Vec::new();
        self.flatten(ctx, 0, &mut parts)?;
        Ok(match parts.len() {
            0 => Value::String(String::new()),
            1 => match parts.pop() {
                Some(Part::Text(s)) => Value::String(s),
                Some(Part::Intrinsic(v)) => v,
                None => Value::String(String::new()),
            },
            _ => {
                let items: Vec<Value> = parts
                    .into_iter()
                    .map(|p| match p {
                        Part::Text(s) => Value::String(s),
                        Part::Intrinsic(v) => v,
                    })
                    .collect();
                json!({ "Fn::Join": ["", items] })
            }
        })
    }

    /// Materialize and require plain text (map keys, names, file paths).
    pub fn resolve_literal(&self, ctx: &ResolveContext) -> Result<String, TokenError> {
        match self.resolve(ctx)? {
            Value::String(s) => Ok(s),
            other => Err(TokenError::NotLiteral(other.to_string())),
        }
    }

    fn flatten(
        &self,
        ctx: &ResolveContext,
        depth: usize,
        out: &mut Vec<Part>,
    ) -> Result<(), TokenError> {
        if depth > MAX_RESOLVE_DEPTH {
            return Err(TokenError::TooDeep(MAX_RESOLVE_DEPTH));
        }
        for fragment in &self.fragments {
            match fragment {
                Fragment::Literal(s) => push_text(out, s),
                Fragment::Ref(id) => match ctx.parameter_value(id) {
                    Some(v) => push_text(out, v),
                    None => out.push(Part::Intrinsic(json!({ "Ref": id }))),
                },
                Fragment::GetAtt(id, attr) => {
                    out.push(Part::Intrinsic(json!({ "Fn::GetAtt": [id, attr] })))
                }
                Fragment::ImportValue(name) => {
                    out.push(Part::Intrinsic(json!({ "Fn::ImportValue": name })))
                }
                Fragment::Lazy(lazy) => lazy.produce()?.flatten(ctx, depth + 1, out)?,
            }
        }
        Ok(())
    }
}

fn push_text(out: &mut Vec<Part>, s: &str) {
    if s.is_empty() {
        return;
    }
    if let Some(Part::Text(last)) = out.last_mut() {
        last.push_str(s);
    } else {
        out.push(Part::Text(s.to_string()));
    }
}

impl From<&str> for TokenString {
    fn from(s: &str) -> Self {
        Self::literal(s)
    }
}

impl From<String> for TokenString {
    fn from(s: String) -> Self {
        Self::literal(s)
    }
}

impl From<&String> for TokenString {
    fn from(s: &String) -> Self {
        Self::literal(s.clone())
    }
}

impl fmt::Display for TokenString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for fragment in &self.fragments {
            match fragment {
                Fragment::Literal(s) => write!(f, "{}", s)?,
                Fragment::Ref(id) => write!(f, "${{Ref:{}}}", id)?,
                Fragment::GetAtt(id, attr) => write!(f, "${{{}.{}}}", id, attr)?,
                Fragment::ImportValue(name) => write!(f, "${{Import:{}}}", name)?,
                Fragment::Lazy(_) => write!(f, "${{Lazy}}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn ctx() -> ResolveContext {
        ResolveContext::default()
    }

    #[test]
    fn test_literal_resolves_to_string() {
        let t = TokenString::literal("nginx:1.25");
        assert_eq!(t.resolve(&ctx()).unwrap(), json!("nginx:1.25"));
        assert_eq!(t.as_literal().as_deref(), Some("nginx:1.25"));
    }

    #[test]
    fn test_adjacent_literals_merge() {
        let t = TokenString::literal("a").push("b").push(String::from("c"));
        assert_eq!(t.resolve(&ctx()).unwrap(), json!("abc"));
    }

    #[test]
    fn test_empty_resolves_to_empty_string() {
        assert_eq!(TokenString::default().resolve(&ctx()).unwrap(), json!(""));
    }

    #[test]
    fn test_single_ref_is_bare_intrinsic() {
        let t = TokenString::reference("Vpc8378EB38");
        assert_eq!(t.resolve(&ctx()).unwrap(), json!({"Ref": "Vpc8378EB38"}));
        assert!(t.as_literal().is_none());
    }

    #[test]
    fn test_mixed_fragments_join() {
        let t = TokenString::reference("AWS::AccountId")
            .push(".dkr.ecr.")
            .push(TokenString::reference("AWS::Region"));
        assert_eq!(
            t.resolve(&ctx()).unwrap(),
            json!({"Fn::Join": ["", [{"Ref": "AWS::AccountId"}, ".dkr.ecr.", {"Ref": "AWS::Region"}]]})
        );
    }

    #[test]
    fn test_get_att_and_import() {
        let t = TokenString::get_att("LB8A12904C", "DNSName");
        assert_eq!(
            t.resolve(&ctx()).unwrap(),
            json!({"Fn::GetAtt": ["LB8A12904C", "DNSName"]})
        );
        let t = TokenString::import_value("DevCluster:VpcId");
        assert_eq!(
            t.resolve(&ctx()).unwrap(),
            json!({"Fn::ImportValue": "DevCluster:VpcId"})
        );
    }

    #[test]
    fn test_parameter_value_substitutes_ref() {
        let mut params = HashMap::new();
        params.insert("ImageTag".to_string(), "abc123".to_string());
        let c = ResolveContext::default().with_parameters(params);
        let t = TokenString::literal("repo:").push(TokenString::reference("ImageTag"));
        assert_eq!(t.resolve(&c).unwrap(), json!("repo:abc123"));
    }

    #[test]
    fn test_lazy_not_evaluated_at_creation() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let t = TokenString::lazy(move || {
            counter.set(counter.get() + 1);
            Ok(TokenString::literal("late"))
        });
        assert_eq!(calls.get(), 0);
        assert!(t.as_literal().is_none());
        assert_eq!(calls.get(), 0);
        assert_eq!(t.resolve(&ctx()).unwrap(), json!("late"));
        assert_eq!(t.resolve(&ctx()).unwrap(), json!("late"));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_lazy_reads_current_state() {
        let slot = Rc::new(std::cell::RefCell::new(String::from("first")));
        let reader = Rc::clone(&slot);
        let t = TokenString::lazy(move || Ok(TokenString::literal(reader.borrow().clone())));
        *slot.borrow_mut() = "second".to_string();
        assert_eq!(t.resolve(&ctx()).unwrap(), json!("second"));
    }

    #[test]
    fn test_lazy_error_propagates() {
        let t = TokenString::literal("x:")
            .push(TokenString::lazy(|| Err(TokenError::Unbound("image".to_string()))));
        assert_eq!(
            t.resolve(&ctx()).unwrap_err(),
            TokenError::Unbound("image".to_string())
        );
    }

    #[test]
    fn test_nested_lazy_depth_limit() {
        fn chain(n: usize) -> TokenString {
            if n == 0 {
                TokenString::literal("leaf")
            } else {
                TokenString::lazy(move || Ok(chain(n - 1)))
            }
        }
        assert_eq!(chain(5).resolve(&ctx()).unwrap(), json!("leaf"));
        assert_eq!(
            chain(MAX_RESOLVE_DEPTH + 5).resolve(&ctx()).unwrap_err(),
            TokenError::TooDeep(MAX_RESOLVE_DEPTH)
        );
    }

    #[test]
    fn test_resolve_literal_rejects_intrinsic() {
        let err = TokenString::reference("Foo")
            .resolve_literal(&ctx())
            .unwrap_err();
        assert!(matches!(err, TokenError::NotLiteral(_)));
    }

    #[test]
    fn test_concat_and_display() {
        let t = TokenString::concat([
            TokenString::literal("arn:"),
            TokenString::reference("AWS::Partition"),
            TokenString::literal(":ecr"),
        ]);
        assert_eq!(t.to_string(), "arn:${Ref:AWS::Partition}:ecr");
        assert_eq!(t.fragments().len(), 3);
    }
}
