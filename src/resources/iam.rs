//! IAM roles and grants.
//!
//! Grants accumulate on a [`Role`] while the stack graph is built; the role
//! and its default policy are rendered once, after every grant has landed.

use crate::core::error::SynthError;
use crate::core::naming::logical_id;
use crate::core::stack::Stack;
use crate::core::template::{CfnResource, Prop};
use crate::core::token::TokenString;

/// An Allow statement.
#[derive(Debug, Clone)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<TokenString>,
}

impl PolicyStatement {
    pub fn allow(actions: &[&str], resources: Vec<TokenString>) -> Self {
        Self {
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
        }
    }

    fn same_as(&self, other: &PolicyStatement) -> bool {
        self.actions == other.actions
            && self.resources.len() == other.resources.len()
            && self
                .resources
                .iter()
                .zip(&other.resources)
                .all(|(a, b)| a.to_string() == b.to_string())
    }

    fn to_prop(&self) -> Prop {
        let action = if self.actions.len() == 1 {
            Prop::from(self.actions[0].clone())
        } else {
            Prop::list(self.actions.iter().map(Prop::from))
        };
        let resource = if self.resources.len() == 1 {
            Prop::from(self.resources[0].clone())
        } else {
            Prop::list(self.resources.iter().cloned().map(Prop::from))
        };
        Prop::map([
            ("Action", action),
            ("Effect", Prop::from("Allow")),
            ("Resource", resource),
        ])
    }
}

/// Something permissions can be granted to.
pub trait Grantable {
    /// Logical id of the principal receiving grants.
    fn grant_principal(&self) -> &str;

    fn add_to_principal_policy(&mut self, statement: PolicyStatement);
}

/// An IAM role assumed by an AWS service.
#[derive(Debug, Clone)]
pub struct Role {
    path: Vec<String>,
    logical_id: String,
    assumed_by: String,
    statements: Vec<PolicyStatement>,
    managed_policy_arns: Vec<TokenString>,
}

impl Role {
    pub fn new(path: &[&str], assumed_by: &str) -> Self {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let logical_id = logical_id(&Self::child(&path, &["Resource"]));
        Self {
            path,
            logical_id,
            assumed_by: assumed_by.to_string(),
            statements: Vec::new(),
            managed_policy_arns: Vec::new(),
        }
    }

    fn child<'a>(path: &'a [String], rest: &[&'a str]) -> Vec<&'a str> {
        path.iter()
            .map(String::as_str)
            .chain(rest.iter().copied())
            .collect()
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn arn(&self) -> TokenString {
        TokenString::get_att(self.logical_id.clone(), "Arn")
    }

    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    /// Logical id the default policy will get, if any grant was made.
    pub fn default_policy_id(&self) -> Option<String> {
        if self.statements.is_empty() {
            return None;
        }
        Some(logical_id(&Self::child(
            &self.path,
            &["DefaultPolicy", "Resource"],
        )))
    }

    pub fn add_managed_policy(&mut self, arn: TokenString) {
        self.managed_policy_arns.push(arn);
    }

    /// Emit the role (and its default policy) into the stack.
    pub fn render(&self, stack: &mut Stack) -> Result<String, SynthError> {
        let assume = Prop::map([
            (
                "Statement",
                Prop::list([Prop::map([
                    ("Action", Prop::from("sts:AssumeRole")),
                    ("Effect", Prop::from("Allow")),
                    (
                        "Principal",
                        Prop::map([("Service", Prop::from(self.assumed_by.clone()))]),
                    ),
                ])]),
            ),
            ("Version", Prop::from("2012-10-17")),
        ]);
        let managed = if self.managed_policy_arns.is_empty() {
            Prop::Null
        } else {
            Prop::list(self.managed_policy_arns.iter().cloned().map(Prop::from))
        };
        let role_id = stack.add_resource(
            &Self::child(&self.path, &["Resource"]),
            CfnResource::new(
                "AWS::IAM::Role",
                Prop::map([
                    ("AssumeRolePolicyDocument", assume),
                    ("ManagedPolicyArns", managed),
                ]),
            ),
        )?;

        if !self.statements.is_empty() {
            let mut policy_name = format!("{}DefaultPolicy", role_id);
            policy_name.truncate(128);
            stack.add_resource(
                &Self::child(&self.path, &["DefaultPolicy", "Resource"]),
                CfnResource::new(
                    "AWS::IAM::Policy",
                    Prop::map([
                        (
                            "PolicyDocument",
                            Prop::map([
                                (
                                    "Statement",
                                    Prop::list(self.statements.iter().map(|s| s.to_prop())),
                                ),
                                ("Version", Prop::from("2012-10-17")),
                            ]),
                        ),
                        ("PolicyName", Prop::from(policy_name)),
                        ("Roles", Prop::list([Prop::reference(role_id.clone())])),
                    ]),
                ),
            )?;
        }
        Ok(role_id)
    }
}

impl Grantable for Role {
    fn grant_principal(&self) -> &str {
        &self.logical_id
    }

    fn add_to_principal_policy(&mut self, statement: PolicyStatement) {
        if !self.statements.iter().any(|s| s.same_as(&statement)) {
            self.statements.push(statement);
        }
    }
}
