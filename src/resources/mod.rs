//! AWS resource constructs. Each builder adds CloudFormation resources to a
//! [`Stack`](crate::core::stack::Stack) and hands back the tokens other
//! constructs reference.

pub mod ecr;
pub mod ecs;
pub mod elb;
pub mod iam;
pub mod image;
pub mod pipeline;
pub mod vpc;
