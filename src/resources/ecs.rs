//! ECS cluster, Fargate task definitions, services and task autoscaling.

use super::iam::{Grantable, PolicyStatement, Role};
use super::image::{ContainerImage, ImageConsumer, RepositoryCredentials};
use crate::core::error::SynthError;
use crate::core::stack::Stack;
use crate::core::template::{CfnParameter, CfnResource, Prop};
use crate::core::token::TokenString;
use indexmap::IndexMap;
use tracing::debug;

const TASKS_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

// ============================================================================
// Cluster
// ============================================================================

#[derive(Debug, Clone)]
pub struct Cluster {
    logical_id: String,
}

impl Cluster {
    pub fn build(stack: &mut Stack, id: &str) -> Result<Self, SynthError> {
        let logical_id = stack.add_resource(
            &[id, "Resource"],
            CfnResource::new("AWS::ECS::Cluster", Prop::map::<&str, _>([])),
        )?;
        Ok(Self { logical_id })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn cluster_name(&self) -> TokenString {
        TokenString::reference(self.logical_id.clone())
    }

    pub fn cluster_arn(&self) -> TokenString {
        TokenString::get_att(self.logical_id.clone(), "Arn")
    }
}

// ============================================================================
// Task definitions
// ============================================================================

/// Settings of one container besides its image.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub port: Option<u16>,
    pub log_prefix: Option<String>,
    pub environment: IndexMap<String, String>,
    pub essential: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerDefinition {
    name: String,
    image: TokenString,
    credentials: Option<RepositoryCredentials>,
    options: ContainerOptions,
    log_group: String,
}

impl ContainerDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &TokenString {
        &self.image
    }

    pub fn port(&self) -> Option<u16> {
        self.options.port
    }

    fn to_prop(&self, stack: &Stack) -> Prop {
        let port_mappings = self.options.port.map(|p| {
            Prop::list([Prop::map([
                ("ContainerPort", Prop::from(p)),
                ("Protocol", Prop::from("tcp")),
            ])])
        });
        let environment = if self.options.environment.is_empty() {
            Prop::Null
        } else {
            Prop::list(self.options.environment.iter().map(|(k, v)| {
                Prop::map([("Name", Prop::from(k)), ("Value", Prop::from(v))])
            }))
        };
        let prefix = self.options.log_prefix.as_deref().unwrap_or(&self.name);
        Prop::map([
            ("Environment", environment),
            ("Essential", Prop::from(self.options.essential)),
            ("Image", Prop::from(self.image.clone())),
            (
                "LogConfiguration",
                Prop::map([
                    ("LogDriver", Prop::from("awslogs")),
                    (
                        "Options",
                        Prop::map([
                            ("awslogs-group", Prop::reference(self.log_group.clone())),
                            ("awslogs-region", Prop::from(stack.region())),
                            ("awslogs-stream-prefix", Prop::from(prefix)),
                        ]),
                    ),
                ]),
            ),
            ("Name", Prop::from(self.name.clone())),
            ("PortMappings", Prop::from(port_mappings)),
            (
                "RepositoryCredentials",
                Prop::from(self.credentials.as_ref().map(|c| c.to_prop())),
            ),
        ])
    }
}

/// The consumer a container image binds to: one container of one task
/// definition, allocating parameters in the task definition's stack.
struct ContainerScope<'a> {
    stack: &'a mut Stack,
    task: &'a str,
    container: &'a str,
    role: &'a mut Role,
}

impl ImageConsumer for ContainerScope<'_> {
    fn stack_name(&self) -> &str {
        self.stack.name()
    }

    fn consumer_path(&self) -> Vec<String> {
        vec![self.task.to_string(), self.container.to_string()]
    }

    fn allocate_parameter(
        &mut self,
        id: &str,
        parameter: CfnParameter,
    ) -> Result<String, SynthError> {
        self.stack
            .add_parameter(&[self.task, self.container, id], parameter)
    }

    fn execution_role(&mut self) -> &mut dyn Grantable {
        &mut *self.role
    }
}

/// A Fargate task definition. Containers are added one at a time; the
/// definition and its roles are rendered once every container is in.
#[derive(Debug)]
pub struct FargateTaskDefinition {
    id: String,
    logical_id: String,
    family: String,
    cpu: u32,
    memory_mib: u32,
    execution_role: Role,
    task_role: Role,
    containers: Vec<ContainerDefinition>,
}

impl FargateTaskDefinition {
    pub fn new(stack: &Stack, id: &str, cpu: u32, memory_mib: u32) -> Self {
        Self {
            id: id.to_string(),
            logical_id: crate::core::naming::logical_id(&[id, "Resource"]),
            family: format!("{}{}", stack.name(), id).replace(['-', '_'], ""),
            cpu,
            memory_mib,
            execution_role: Role::new(&[id, "ExecutionRole"], TASKS_PRINCIPAL),
            task_role: Role::new(&[id, "TaskRole"], TASKS_PRINCIPAL),
            containers: Vec::new(),
        }
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn execution_role(&self) -> &Role {
        &self.execution_role
    }

    pub fn task_role(&self) -> &Role {
        &self.task_role
    }

    pub fn containers(&self) -> &[ContainerDefinition] {
        &self.containers
    }

    pub fn container(&self, name: &str) -> Option<&ContainerDefinition> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Bind `image` to a new container and add its log group.
    pub fn add_container(
        &mut self,
        stack: &mut Stack,
        name: &str,
        image: &ContainerImage,
        options: ContainerOptions,
    ) -> Result<&ContainerDefinition, SynthError> {
        if self.container(name).is_some() {
            return Err(SynthError::DuplicateLogicalId {
                stack: stack.name().to_string(),
                id: format!("{}/{}", self.id, name),
            });
        }

        let config = {
            let mut scope = ContainerScope {
                stack: &mut *stack,
                task: &self.id,
                container: name,
                role: &mut self.execution_role,
            };
            image.bind(&mut scope)?
        };

        let log_group = stack.add_resource(
            &[self.id.as_str(), name, "LogGroup", "Resource"],
            CfnResource::new(
                "AWS::Logs::LogGroup",
                Prop::map([("RetentionInDays", Prop::from(30i64))]),
            ),
        )?;
        self.execution_role
            .add_to_principal_policy(PolicyStatement::allow(
                &["logs:CreateLogStream", "logs:PutLogEvents"],
                vec![TokenString::get_att(log_group.clone(), "Arn")],
            ));

        debug!(
            stack = stack.name(),
            task = %self.id,
            container = name,
            deferred = image.is_deferred(),
            "added container"
        );

        self.containers.push(ContainerDefinition {
            name: name.to_string(),
            image: config.image_name,
            credentials: config.repository_credentials,
            options,
            log_group,
        });
        Ok(&self.containers[self.containers.len() - 1])
    }

    /// Emit the roles and the task definition. Returns the definition's
    /// logical id.
    pub fn render(&self, stack: &mut Stack) -> Result<String, SynthError> {
        let execution_role = self.execution_role.render(stack)?;
        let task_role = self.task_role.render(stack)?;
        let containers = {
            let stack: &Stack = stack;
            Prop::list(self.containers.iter().map(|c| c.to_prop(stack)))
        };

        let mut resource = CfnResource::new(
            "AWS::ECS::TaskDefinition",
            Prop::map([
                ("ContainerDefinitions", containers),
                ("Cpu", Prop::from(self.cpu.to_string())),
                ("ExecutionRoleArn", Prop::get_att(execution_role, "Arn")),
                ("Family", Prop::from(self.family.clone())),
                ("Memory", Prop::from(self.memory_mib.to_string())),
                ("NetworkMode", Prop::from("awsvpc")),
                ("RequiresCompatibilities", Prop::list([Prop::from("FARGATE")])),
                ("TaskRoleArn", Prop::get_att(task_role, "Arn")),
            ]),
        );
        if let Some(policy) = self.execution_role.default_policy_id() {
            resource = resource.depends_on(policy);
        }
        stack.add_resource(&[self.id.as_str(), "Resource"], resource)
    }
}

// ============================================================================
// Services
// ============================================================================

/// Network placement of a service.
#[derive(Debug, Clone)]
pub struct ServiceNetwork {
    pub vpc_id: TokenString,
    pub subnets: Vec<TokenString>,
}

#[derive(Debug, Clone)]
struct LoadBalancerTarget {
    container: String,
    port: u16,
    target_group_arn: TokenString,
    listener: String,
}

/// A Fargate service in private subnets. Its security group exists as
/// soon as the service is created, so load balancers can open ingress to
/// it before the service itself is rendered.
#[derive(Debug)]
pub struct FargateService {
    id: String,
    logical_id: String,
    security_group: String,
    cluster: TokenString,
    network: ServiceNetwork,
    desired_count: u32,
    targets: Vec<LoadBalancerTarget>,
}

impl FargateService {
    pub fn new(
        stack: &mut Stack,
        id: &str,
        cluster: TokenString,
        network: ServiceNetwork,
        desired_count: u32,
    ) -> Result<Self, SynthError> {
        let security_group = stack.add_resource(
            &[id, "SecurityGroup", "Resource"],
            CfnResource::new(
                "AWS::EC2::SecurityGroup",
                Prop::map([
                    (
                        "GroupDescription",
                        Prop::from(format!("{}/{}/SecurityGroup", stack.name(), id)),
                    ),
                    (
                        "SecurityGroupEgress",
                        Prop::list([Prop::map([
                            ("CidrIp", Prop::from("0.0.0.0/0")),
                            ("Description", Prop::from("Allow all outbound traffic by default")),
                            ("IpProtocol", Prop::from("-1")),
                        ])]),
                    ),
                    ("VpcId", Prop::from(network.vpc_id.clone())),
                ]),
            ),
        )?;
        Ok(Self {
            id: id.to_string(),
            logical_id: crate::core::naming::logical_id(&[id, "Service"]),
            security_group,
            cluster,
            network,
            desired_count,
            targets: Vec::new(),
        })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn security_group_id(&self) -> TokenString {
        TokenString::get_att(self.security_group.clone(), "GroupId")
    }

    pub fn service_name(&self) -> TokenString {
        TokenString::get_att(self.logical_id.clone(), "Name")
    }

    /// Register a container port behind a target group.
    pub fn attach_target(
        &mut self,
        container: &str,
        port: u16,
        target_group_arn: TokenString,
        listener: &str,
    ) {
        self.targets.push(LoadBalancerTarget {
            container: container.to_string(),
            port,
            target_group_arn,
            listener: listener.to_string(),
        });
    }

    pub fn render(
        &self,
        stack: &mut Stack,
        task_definition: &str,
    ) -> Result<String, SynthError> {
        let load_balancers = if self.targets.is_empty() {
            Prop::Null
        } else {
            Prop::list(self.targets.iter().map(|t| {
                Prop::map([
                    ("ContainerName", Prop::from(t.container.clone())),
                    ("ContainerPort", Prop::from(t.port)),
                    ("TargetGroupArn", Prop::from(t.target_group_arn.clone())),
                ])
            }))
        };
        let grace = if self.targets.is_empty() {
            Prop::Null
        } else {
            Prop::from(60i64)
        };
        let mut resource = CfnResource::new(
            "AWS::ECS::Service",
            Prop::map([
                ("Cluster", Prop::from(self.cluster.clone())),
                (
                    "DeploymentConfiguration",
                    Prop::map([
                        ("MaximumPercent", Prop::from(200i64)),
                        ("MinimumHealthyPercent", Prop::from(50i64)),
                    ]),
                ),
                ("DesiredCount", Prop::from(self.desired_count)),
                ("EnableECSManagedTags", Prop::from(false)),
                ("HealthCheckGracePeriodSeconds", grace),
                ("LaunchType", Prop::from("FARGATE")),
                ("LoadBalancers", load_balancers),
                (
                    "NetworkConfiguration",
                    Prop::map([(
                        "AwsvpcConfiguration",
                        Prop::map([
                            ("AssignPublicIp", Prop::from("DISABLED")),
                            (
                                "SecurityGroups",
                                Prop::list([Prop::from(self.security_group_id())]),
                            ),
                            (
                                "Subnets",
                                Prop::list(self.network.subnets.iter().cloned().map(Prop::from)),
                            ),
                        ]),
                    )]),
                ),
                ("TaskDefinition", Prop::reference(task_definition)),
            ]),
        );
        for t in &self.targets {
            resource = resource.depends_on(t.listener.clone());
        }
        stack.add_resource(&[self.id.as_str(), "Service"], resource)
    }
}

// ============================================================================
// Autoscaling
// ============================================================================

/// CPU target-tracking settings.
#[derive(Debug, Clone, Copy)]
pub struct CpuScaling {
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub target_percent: u32,
    pub cooldown_seconds: u32,
}

/// Scale the service's task count on average CPU utilization. Returns the
/// scaling policy's logical id.
pub fn scale_on_cpu(
    stack: &mut Stack,
    service_id: &str,
    service: &FargateService,
    cluster: &TokenString,
    scaling: CpuScaling,
) -> Result<String, SynthError> {
    let role_arn = TokenString::literal("arn:")
        .push(stack.partition())
        .push(":iam::")
        .push(stack.account())
        .push(
            ":role/aws-service-role/ecs.application-autoscaling.amazonaws.com/\
             AWSServiceRoleForApplicationAutoScaling_ECSService",
        );
    let resource_id = TokenString::literal("service/")
        .push(cluster.clone())
        .push("/")
        .push(service.service_name());

    let target = stack.add_resource(
        &[service_id, "TaskCount", "Target", "Resource"],
        CfnResource::new(
            "AWS::ApplicationAutoScaling::ScalableTarget",
            Prop::map([
                ("MaxCapacity", Prop::from(scaling.max_capacity)),
                ("MinCapacity", Prop::from(scaling.min_capacity)),
                ("ResourceId", Prop::from(resource_id)),
                ("RoleARN", Prop::from(role_arn)),
                ("ScalableDimension", Prop::from("ecs:service:DesiredCount")),
                ("ServiceNamespace", Prop::from("ecs")),
            ]),
        ),
    )?;

    let path = [service_id, "TaskCount", "Target", "CpuScaling", "Resource"];
    let policy_name = crate::core::naming::logical_id(&path);
    stack.add_resource(
        &path,
        CfnResource::new(
            "AWS::ApplicationAutoScaling::ScalingPolicy",
            Prop::map([
                ("PolicyName", Prop::from(policy_name)),
                ("PolicyType", Prop::from("TargetTrackingScaling")),
                ("ScalingTargetId", Prop::reference(target)),
                (
                    "TargetTrackingScalingPolicyConfiguration",
                    Prop::map([
                        (
                            "PredefinedMetricSpecification",
                            Prop::map([(
                                "PredefinedMetricType",
                                Prop::from("ECSServiceAverageCPUUtilization"),
                            )]),
                        ),
                        ("ScaleInCooldown", Prop::from(scaling.cooldown_seconds)),
                        ("ScaleOutCooldown", Prop::from(scaling.cooldown_seconds)),
                        ("TargetValue", Prop::from(scaling.target_percent)),
                    ]),
                ),
            ]),
        ),
    )
}
