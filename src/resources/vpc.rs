//! VPC with one public and one private subnet per availability zone.
//!
//! The CIDR block is carved into `2 × max_azs` equal subnets: public
//! subnets take the first half, private subnets the second. Every private
//! subnet routes egress through the NAT gateway of the public subnet in the
//! same zone.

use crate::core::cidr::Ipv4Cidr;
use crate::core::error::SynthError;
use crate::core::stack::Stack;
use crate::core::template::{CfnResource, Prop};
use crate::core::token::TokenString;
use tracing::debug;

/// Availability zone `index` of the stack's region.
fn select_az(index: usize) -> Prop {
    Prop::map([(
        "Fn::Select",
        Prop::list([
            Prop::from(index as i64),
            Prop::map([("Fn::GetAZs", Prop::from(""))]),
        ]),
    )])
}

fn name_tag(stack: &Stack, path: &[&str]) -> Prop {
    let mut name = stack.name().to_string();
    for p in path {
        name.push('/');
        name.push_str(p);
    }
    Prop::list([Prop::map([
        ("Key", Prop::from("Name")),
        ("Value", Prop::from(name)),
    ])])
}

#[derive(Debug, Clone)]
pub struct Vpc {
    logical_id: String,
    cidr: Ipv4Cidr,
    public_subnets: Vec<String>,
    private_subnets: Vec<String>,
}

impl Vpc {
    pub fn build(
        stack: &mut Stack,
        id: &str,
        cidr: &str,
        max_azs: u8,
    ) -> Result<Self, SynthError> {
        let block: Ipv4Cidr = cidr.parse().map_err(|reason| SynthError::Cidr {
            cidr: cidr.to_string(),
            reason,
        })?;
        let azs = usize::from(max_azs);
        let subnets = block.split(azs * 2).map_err(|reason| SynthError::Cidr {
            cidr: cidr.to_string(),
            reason,
        })?;

        let vpc_id = stack.add_resource(
            &[id, "Resource"],
            CfnResource::new(
                "AWS::EC2::VPC",
                Prop::map([
                    ("CidrBlock", Prop::from(block.to_string())),
                    ("EnableDnsHostnames", Prop::from(true)),
                    ("EnableDnsSupport", Prop::from(true)),
                    ("InstanceTenancy", Prop::from("default")),
                    ("Tags", name_tag(stack, &[id])),
                ]),
            ),
        )?;

        let igw_id = stack.add_resource(
            &[id, "IGW"],
            CfnResource::new(
                "AWS::EC2::InternetGateway",
                Prop::map([("Tags", name_tag(stack, &[id]))]),
            ),
        )?;
        let attachment_id = stack.add_resource(
            &[id, "VPCGW"],
            CfnResource::new(
                "AWS::EC2::VPCGatewayAttachment",
                Prop::map([
                    ("InternetGatewayId", Prop::reference(igw_id.clone())),
                    ("VpcId", Prop::reference(vpc_id.clone())),
                ]),
            ),
        )?;

        let (public_blocks, private_blocks) = subnets.split_at(azs);
        let mut public_subnets = Vec::with_capacity(azs);
        let mut nat_gateways = Vec::with_capacity(azs);
        for (i, block) in public_blocks.iter().enumerate() {
            let name = format!("PublicSubnet{}", i + 1);
            let subnet = Self::subnet(stack, id, &name, &vpc_id, block, i, true)?;
            let route_table = Self::route_table(stack, id, &name, &vpc_id, &subnet)?;
            stack.add_resource(
                &[id, &name, "DefaultRoute"],
                CfnResource::new(
                    "AWS::EC2::Route",
                    Prop::map([
                        ("DestinationCidrBlock", Prop::from("0.0.0.0/0")),
                        ("GatewayId", Prop::reference(igw_id.clone())),
                        ("RouteTableId", Prop::reference(route_table)),
                    ]),
                )
                .depends_on(attachment_id.clone()),
            )?;
            let eip = stack.add_resource(
                &[id, &name, "EIP"],
                CfnResource::new(
                    "AWS::EC2::EIP",
                    Prop::map([
                        ("Domain", Prop::from("vpc")),
                        ("Tags", name_tag(stack, &[id, &name])),
                    ]),
                ),
            )?;
            let nat = stack.add_resource(
                &[id, &name, "NATGateway"],
                CfnResource::new(
                    "AWS::EC2::NatGateway",
                    Prop::map([
                        ("AllocationId", Prop::get_att(eip, "AllocationId")),
                        ("SubnetId", Prop::reference(subnet.clone())),
                        ("Tags", name_tag(stack, &[id, &name])),
                    ]),
                ),
            )?;
            public_subnets.push(subnet);
            nat_gateways.push(nat);
        }

        let mut private_subnets = Vec::with_capacity(azs);
        for (i, block) in private_blocks.iter().enumerate() {
            let name = format!("PrivateSubnet{}", i + 1);
            let subnet = Self::subnet(stack, id, &name, &vpc_id, block, i, false)?;
            let route_table = Self::route_table(stack, id, &name, &vpc_id, &subnet)?;
            stack.add_resource(
                &[id, &name, "DefaultRoute"],
                CfnResource::new(
                    "AWS::EC2::Route",
                    Prop::map([
                        ("DestinationCidrBlock", Prop::from("0.0.0.0/0")),
                        ("NatGatewayId", Prop::reference(nat_gateways[i].clone())),
                        ("RouteTableId", Prop::reference(route_table)),
                    ]),
                ),
            )?;
            private_subnets.push(subnet);
        }

        debug!(stack = stack.name(), vpc = %vpc_id, %block, azs, "built vpc");
        Ok(Self {
            logical_id: vpc_id,
            cidr: block,
            public_subnets,
            private_subnets,
        })
    }

    fn subnet(
        stack: &mut Stack,
        id: &str,
        name: &str,
        vpc_id: &str,
        block: &Ipv4Cidr,
        az: usize,
        public: bool,
    ) -> Result<String, SynthError> {
        let kind = if public { "Public" } else { "Private" };
        stack.add_resource(
            &[id, name, "Subnet"],
            CfnResource::new(
                "AWS::EC2::Subnet",
                Prop::map([
                    ("AvailabilityZone", select_az(az)),
                    ("CidrBlock", Prop::from(block.to_string())),
                    ("MapPublicIpOnLaunch", Prop::from(public)),
                    (
                        "Tags",
                        Prop::list([
                            Prop::map([
                                ("Key", Prop::from("Name")),
                                ("Value", Prop::from(format!("{}/{}/{}", stack.name(), id, name))),
                            ]),
                            Prop::map([
                                ("Key", Prop::from("ecsforge:subnet-type")),
                                ("Value", Prop::from(kind)),
                            ]),
                        ]),
                    ),
                    ("VpcId", Prop::reference(vpc_id)),
                ]),
            ),
        )
    }

    fn route_table(
        stack: &mut Stack,
        id: &str,
        name: &str,
        vpc_id: &str,
        subnet: &str,
    ) -> Result<String, SynthError> {
        let table = stack.add_resource(
            &[id, name, "RouteTable"],
            CfnResource::new(
                "AWS::EC2::RouteTable",
                Prop::map([
                    ("Tags", name_tag(stack, &[id, name])),
                    ("VpcId", Prop::reference(vpc_id)),
                ]),
            ),
        )?;
        stack.add_resource(
            &[id, name, "RouteTableAssociation"],
            CfnResource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                Prop::map([
                    ("RouteTableId", Prop::reference(table.clone())),
                    ("SubnetId", Prop::reference(subnet)),
                ]),
            ),
        )?;
        Ok(table)
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn cidr(&self) -> &Ipv4Cidr {
        &self.cidr
    }

    pub fn vpc_id(&self) -> TokenString {
        TokenString::reference(self.logical_id.clone())
    }

    pub fn public_subnet_ids(&self) -> Vec<TokenString> {
        self.public_subnets
            .iter()
            .map(|s| TokenString::reference(s.clone()))
            .collect()
    }

    pub fn private_subnet_ids(&self) -> Vec<TokenString> {
        self.private_subnets
            .iter()
            .map(|s| TokenString::reference(s.clone()))
            .collect()
    }
}
