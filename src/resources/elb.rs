//! Internet-facing application load balancer in front of a Fargate service.

use super::ecs::FargateService;
use crate::core::error::SynthError;
use crate::core::naming::logical_id;
use crate::core::stack::Stack;
use crate::core::template::{CfnResource, Prop};
use crate::core::token::TokenString;
use tracing::debug;

fn allow_all_egress() -> Prop {
    Prop::list([Prop::map([
        ("CidrIp", Prop::from("0.0.0.0/0")),
        ("Description", Prop::from("Allow all outbound traffic by default")),
        ("IpProtocol", Prop::from("-1")),
    ])])
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    id: String,
    logical_id: String,
    security_group: String,
    vpc_id: TokenString,
}

impl LoadBalancer {
    /// An internet-facing ALB spread over the given public subnets.
    pub fn build(
        stack: &mut Stack,
        id: &str,
        vpc_id: TokenString,
        subnets: Vec<TokenString>,
    ) -> Result<Self, SynthError> {
        let description = format!(
            "Automatically created Security Group for ELB {}{}",
            stack.name(),
            id
        );
        let security_group = stack.add_resource(
            &[id, "SecurityGroup", "Resource"],
            CfnResource::new(
                "AWS::EC2::SecurityGroup",
                Prop::map([
                    ("GroupDescription", Prop::from(description)),
                    ("SecurityGroupEgress", allow_all_egress()),
                    ("VpcId", Prop::from(vpc_id.clone())),
                ]),
            ),
        )?;
        let logical_id = stack.add_resource(
            &[id, "Resource"],
            CfnResource::new(
                "AWS::ElasticLoadBalancingV2::LoadBalancer",
                Prop::map([
                    (
                        "LoadBalancerAttributes",
                        Prop::list([Prop::map([
                            ("Key", Prop::from("deletion_protection.enabled")),
                            ("Value", Prop::from("false")),
                        ])]),
                    ),
                    ("Scheme", Prop::from("internet-facing")),
                    (
                        "SecurityGroups",
                        Prop::list([Prop::get_att(security_group.clone(), "GroupId")]),
                    ),
                    ("Subnets", Prop::list(subnets.into_iter().map(Prop::from))),
                    ("Type", Prop::from("application")),
                ]),
            ),
        )?;
        Ok(Self {
            id: id.to_string(),
            logical_id,
            security_group,
            vpc_id,
        })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn dns_name(&self) -> TokenString {
        TokenString::get_att(self.logical_id.clone(), "DNSName")
    }

    pub fn security_group_id(&self) -> TokenString {
        TokenString::get_att(self.security_group.clone(), "GroupId")
    }

    /// Open `port` to the world and forward it to a new IP target group
    /// whose targets listen on `target_port`.
    pub fn add_listener(
        &self,
        stack: &mut Stack,
        id: &str,
        port: u16,
        target_id: &str,
        target_port: u16,
    ) -> Result<Listener, SynthError> {
        stack.add_resource(
            &[self.id.as_str(), "SecurityGroup", &format!("from 0.0.0.0_0:{}", port)],
            CfnResource::new(
                "AWS::EC2::SecurityGroupIngress",
                Prop::map([
                    ("CidrIp", Prop::from("0.0.0.0/0")),
                    ("Description", Prop::from(format!("Allow from anyone on port {}", port))),
                    ("FromPort", Prop::from(port)),
                    ("GroupId", Prop::from(self.security_group_id())),
                    ("IpProtocol", Prop::from("tcp")),
                    ("ToPort", Prop::from(port)),
                ]),
            ),
        )?;

        let target_group = stack.add_resource(
            &[self.id.as_str(), id, target_id, "Group", "Resource"],
            CfnResource::new(
                "AWS::ElasticLoadBalancingV2::TargetGroup",
                Prop::map([
                    ("Port", Prop::from(target_port)),
                    ("Protocol", Prop::from("HTTP")),
                    (
                        "TargetGroupAttributes",
                        Prop::list([Prop::map([
                            ("Key", Prop::from("stickiness.enabled")),
                            ("Value", Prop::from("false")),
                        ])]),
                    ),
                    ("TargetType", Prop::from("ip")),
                    ("VpcId", Prop::from(self.vpc_id.clone())),
                ]),
            ),
        )?;

        let listener = stack.add_resource(
            &[self.id.as_str(), id, "Resource"],
            CfnResource::new(
                "AWS::ElasticLoadBalancingV2::Listener",
                Prop::map([
                    (
                        "DefaultActions",
                        Prop::list([Prop::map([
                            ("TargetGroupArn", Prop::reference(target_group.clone())),
                            ("Type", Prop::from("forward")),
                        ])]),
                    ),
                    ("LoadBalancerArn", Prop::reference(self.logical_id.clone())),
                    ("Port", Prop::from(port)),
                    ("Protocol", Prop::from("HTTP")),
                ]),
            ),
        )?;

        Ok(Listener {
            logical_id: listener,
            target_group,
            target_port,
            load_balancer_security_group: self.security_group_id(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Listener {
    logical_id: String,
    target_group: String,
    target_port: u16,
    load_balancer_security_group: TokenString,
}

impl Listener {
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn target_group_arn(&self) -> TokenString {
        TokenString::reference(self.target_group.clone())
    }

    /// Register a service container as the listener's target and let the
    /// load balancer reach it through the service's security group.
    pub fn forward_to(
        &self,
        stack: &mut Stack,
        service_id: &str,
        service: &mut FargateService,
        container: &str,
    ) -> Result<(), SynthError> {
        let rule = format!("from {}:{}", self.logical_id, self.target_port);
        stack.add_resource(
            &[service_id, "SecurityGroup", &rule],
            CfnResource::new(
                "AWS::EC2::SecurityGroupIngress",
                Prop::map([
                    ("Description", Prop::from("Load balancer to target")),
                    ("FromPort", Prop::from(self.target_port)),
                    ("GroupId", Prop::from(service.security_group_id())),
                    ("IpProtocol", Prop::from("tcp")),
                    (
                        "SourceSecurityGroupId",
                        Prop::from(self.load_balancer_security_group.clone()),
                    ),
                    ("ToPort", Prop::from(self.target_port)),
                ]),
            ),
        )?;
        service.attach_target(
            container,
            self.target_port,
            self.target_group_arn(),
            &self.logical_id,
        );
        debug!(
            stack = stack.name(),
            listener = %self.logical_id,
            container,
            port = self.target_port,
            "forwarding listener"
        );
        Ok(())
    }
}

/// Logical id the listener at `path` gets, for callers that need it before
/// it is created.
pub fn listener_id(load_balancer: &str, listener: &str) -> String {
    logical_id(&[load_balancer, listener, "Resource"])
}
