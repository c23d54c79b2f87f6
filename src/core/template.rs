//! CloudFormation template model with token-aware properties.

use super::error::{SynthError, TokenError};
use super::token::{ResolveContext, TokenString};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use std::fmt;
use std::rc::Rc;

type ProduceProp = dyn Fn() -> Result<Prop, TokenError>;

/// A property sub-tree built on demand at synthesis time.
#[derive(Clone)]
pub struct LazyProp {
    produce: Rc<ProduceProp>,
}

impl LazyProp {
    pub fn produce(&self) -> Result<Prop, TokenError> {
        (self.produce)()
    }
}

impl fmt::Debug for LazyProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LazyProp(..)")
    }
}

/// A resource property value. Strings are [`TokenString`]s so any leaf can
/// carry a deferred reference until synthesis.
#[derive(Debug, Clone)]
pub enum Prop {
    Null,
    Bool(bool),
    Int(i64),
    Str(TokenString),
    List(Vec<Prop>),
    Map(IndexMap<String, Prop>),
    /// Sub-tree serialized into a JSON string (payloads interpreted by the
    /// receiving service, such as CodePipeline parameter overrides).
    Json(Box<Prop>),
    /// Sub-tree whose shape depends on graph state at synthesis time, such
    /// as a map with one entry per binding made after construction.
    Deferred(LazyProp),
}

impl Prop {
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Prop)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Prop>,
    {
        Self::List(items.into_iter().collect())
    }

    pub fn deferred(produce: impl Fn() -> Result<Prop, TokenError> + 'static) -> Self {
        Self::Deferred(LazyProp {
            produce: Rc::new(produce),
        })
    }

    /// Shorthand for `{"Ref": id}`.
    pub fn reference(logical_id: impl Into<String>) -> Self {
        Self::Str(TokenString::reference(logical_id))
    }

    /// Shorthand for `{"Fn::GetAtt": [id, attr]}`.
    pub fn get_att(logical_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Str(TokenString::get_att(logical_id, attribute))
    }

    /// Look up a key in a `Map` prop.
    pub fn get(&self, key: &str) -> Option<&Prop> {
        match self {
            Self::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Insert or replace a key in a `Map` prop. No-op on other variants.
    pub fn set(&mut self, key: &str, value: Prop) {
        if let Self::Map(m) = self {
            m.insert(key.to_string(), value);
        }
    }

    /// Materialize into JSON. `Null` map entries are omitted.
    pub fn resolve(&self, ctx: &ResolveContext) -> Result<Value, TokenError> {
        Ok(match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => json!(i),
            Self::Str(t) => t.resolve(ctx)?,
            Self::List(items) => Value::Array(
                items
                    .iter()
                    .map(|p| p.resolve(ctx))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Self::Map(entries) => {
                let mut out = Map::new();
                for (k, v) in entries {
                    if matches!(v, Self::Null) {
                        continue;
                    }
                    out.insert(k.clone(), v.resolve(ctx)?);
                }
                Value::Object(out)
            }
            Self::Json(inner) => Value::String(inner.resolve(ctx)?.to_string()),
            Self::Deferred(lazy) => lazy.produce()?.resolve(ctx)?,
        })
    }
}

impl From<&str> for Prop {
    fn from(s: &str) -> Self {
        Self::Str(TokenString::literal(s))
    }
}

impl From<String> for Prop {
    fn from(s: String) -> Self {
        Self::Str(TokenString::literal(s))
    }
}

impl From<&String> for Prop {
    fn from(s: &String) -> Self {
        Self::Str(TokenString::literal(s.clone()))
    }
}

impl From<TokenString> for Prop {
    fn from(t: TokenString) -> Self {
        Self::Str(t)
    }
}

impl From<bool> for Prop {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Prop {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u16> for Prop {
    fn from(i: u16) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Prop {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<Vec<Prop>> for Prop {
    fn from(items: Vec<Prop>) -> Self {
        Self::List(items)
    }
}

impl<T: Into<Prop>> From<Option<T>> for Prop {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A template parameter.
#[derive(Debug, Clone)]
pub struct CfnParameter {
    pub param_type: String,
    pub default: Option<String>,
    pub description: Option<String>,
}

impl CfnParameter {
    /// A `String` parameter with no default.
    pub fn string() -> Self {
        Self {
            param_type: "String".to_string(),
            default: None,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A template resource.
#[derive(Debug, Clone)]
pub struct CfnResource {
    pub resource_type: String,
    pub properties: Prop,
    pub depends_on: Vec<String>,
}

impl CfnResource {
    pub fn new(resource_type: &str, properties: Prop) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }
}

/// A template output, optionally exported for other stacks.
#[derive(Debug, Clone)]
pub struct CfnOutput {
    pub value: TokenString,
    pub description: Option<String>,
    pub export_name: Option<String>,
}

impl CfnOutput {
    pub fn new(value: TokenString) -> Self {
        Self {
            value,
            description: None,
            export_name: None,
        }
    }

    pub fn exported_as(mut self, export_name: impl Into<String>) -> Self {
        self.export_name = Some(export_name.into());
        self
    }
}

/// One CloudFormation template.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub description: Option<String>,
    pub parameters: IndexMap<String, CfnParameter>,
    pub resources: IndexMap<String, CfnResource>,
    pub outputs: IndexMap<String, CfnOutput>,
}

impl Template {
    /// Whether a logical id is taken by a parameter or resource.
    pub fn contains(&self, logical_id: &str) -> bool {
        self.parameters.contains_key(logical_id) || self.resources.contains_key(logical_id)
    }

    /// Materialize the template. Parameters given a value in `ctx` keep
    /// their declaration (with that value as `Default`) and every `Ref` to
    /// them is replaced by the value.
    pub fn synth(&self, ctx: &ResolveContext) -> Result<Value, SynthError> {
        let mut root = Map::new();
        root.insert(
            "AWSTemplateFormatVersion".to_string(),
            json!("2010-09-09"),
        );
        if let Some(ref d) = self.description {
            root.insert("Description".to_string(), json!(d));
        }

        if !self.parameters.is_empty() {
            let mut params = Map::new();
            for (id, p) in &self.parameters {
                let mut decl = Map::new();
                decl.insert("Type".to_string(), json!(p.param_type));
                let default = ctx.parameter_value(id).or(p.default.as_deref());
                if let Some(d) = default {
                    decl.insert("Default".to_string(), json!(d));
                }
                if let Some(ref d) = p.description {
                    decl.insert("Description".to_string(), json!(d));
                }
                params.insert(id.clone(), Value::Object(decl));
            }
            root.insert("Parameters".to_string(), Value::Object(params));
        }

        let mut resources = Map::new();
        for (id, r) in &self.resources {
            let mut decl = Map::new();
            decl.insert("Type".to_string(), json!(r.resource_type));
            let props = r.properties.resolve(ctx)?;
            let has_props = match props {
                Value::Null => false,
                Value::Object(ref o) => !o.is_empty(),
                _ => true,
            };
            if has_props {
                decl.insert("Properties".to_string(), props);
            }
            if !r.depends_on.is_empty() {
                let mut deps = r.depends_on.clone();
                deps.sort();
                deps.dedup();
                decl.insert("DependsOn".to_string(), json!(deps));
            }
            resources.insert(id.clone(), Value::Object(decl));
        }
        root.insert("Resources".to_string(), Value::Object(resources));

        if !self.outputs.is_empty() {
            let mut outputs = Map::new();
            for (id, o) in &self.outputs {
                let mut decl = Map::new();
                decl.insert("Value".to_string(), o.value.resolve(ctx)?);
                if let Some(ref d) = o.description {
                    decl.insert("Description".to_string(), json!(d));
                }
                if let Some(ref name) = o.export_name {
                    decl.insert("Export".to_string(), json!({ "Name": name }));
                }
                outputs.insert(id.clone(), Value::Object(decl));
            }
            root.insert("Outputs".to_string(), Value::Object(outputs));
        }

        Ok(Value::Object(root))
    }
}
