//! Sample project written by `stackctl init --sample`
//!
//! An AWS topology: networking, an Aurora cluster, an ECS cluster, a load
//! balancer with certificates, two backend services and a GitHub OIDC role.

pub const SAMPLE_ORDER: &[&str] = &[
    "vpc",
    "aurora",
    "ecs",
    "certificates",
    "load_balancer",
    "users-api",
    "reviews-api",
    "github",
];

pub const SAMPLE_MANIFESTS: &[(&str, &str)] = &[
    ("vpc", VPC),
    ("aurora", AURORA),
    ("ecs", ECS),
    ("certificates", CERTIFICATES),
    ("load_balancer", LOAD_BALANCER),
    ("users-api", USERS_API),
    ("reviews-api", REVIEWS_API),
    ("github", GITHUB),
];

const VPC: &str = r#"name: vpc
description: Network with public and private subnets
config:
  cidr_block: 10.0.0.0/16
  number_of_availability_zones: 2
  nat_gateway_strategy: Single
resources:
  - type: awsx:ec2:Vpc
    name: vpc-${env}
    properties:
      cidr_block: ${config.cidr_block}
      enable_dns_hostnames: true
      number_of_availability_zones: ${config.number_of_availability_zones}
      nat_gateways:
        strategy: ${config.nat_gateway_strategy}
  - type: aws:ec2:SecurityGroup
    name: web-security-group
    properties:
      description: Enable HTTP access
      ingress:
        - { protocol: tcp, from_port: 80, to_port: 80, cidr_blocks: ["0.0.0.0/0"] }
      egress:
        - { protocol: "-1", from_port: 0, to_port: 0, cidr_blocks: ["0.0.0.0/0"] }
exports:
  cidr_block: ${config.cidr_block}
outputs:
  - name: vpc_id
  - name: public_subnet_ids
    type: list
  - name: private_subnet_ids
    type: list
  - name: cidr_block
  - name: web_security_group_id
"#;

const AURORA: &str = r#"name: aurora
description: Aurora Postgres serverless cluster
inputs:
  - stack: vpc
    outputs: [vpc_id, public_subnet_ids, private_subnet_ids]
config:
  db_identifier: orangejuicedb
  engine_version: "15.4"
  backup_retention_period: 7
  min_capacity: 0.5
  max_capacity: 2
  instance_count: 1
  # The deployed variant uses public subnets; set false to keep the cluster private
  public_access: true
resources:
  - type: random:RandomPassword
    name: db-password
    properties:
      length: 32
      special: true
  - type: aws:ec2:SecurityGroup
    name: db-security-group
    properties:
      description: Database security group
      vpc_id: ${vpc.vpc_id}
  - type: aws:rds:SubnetGroup
    name: db-subnet-group
    properties:
      subnet_ids: ${vpc.public_subnet_ids}
      public_access: ${config.public_access}
  - type: aws:rds:Cluster
    name: ${config.db_identifier}
    properties:
      engine: aurora-postgresql
      engine_version: ${config.engine_version}
      backup_retention_period: ${config.backup_retention_period}
      serverlessv2_scaling_configuration:
        min_capacity: ${config.min_capacity}
        max_capacity: ${config.max_capacity}
  - type: aws:secretsmanager:Secret
    name: db-credentials
    properties:
      name: ${config.db_identifier}-credentials-${env}
outputs:
  - name: orangejuicedb_credentials_secret_arn
    sensitive: true
    description: ARN of the secret holding the database credentials
  - name: cluster_endpoint
  - name: instance_count
    type: number
exports:
  instance_count: ${config.instance_count}
"#;

const ECS: &str = r#"name: ecs
description: ECS cluster on Fargate with service connect
inputs:
  - stack: vpc
    outputs: [vpc_id]
  - stack: aurora
    outputs: [orangejuicedb_credentials_secret_arn]
config:
  container_insights: enabled
  fargate_base: 1
  fargate_weight: 1
  fargate_spot_weight: 3
resources:
  - type: aws:servicediscovery:PrivateDnsNamespace
    name: service-connect-namespace
    properties:
      name: local
      vpc: ${vpc.vpc_id}
  - type: aws:ecs:Cluster
    name: ecs-cluster
    properties:
      settings:
        - name: containerInsights
          value: ${config.container_insights}
  - type: aws:ecs:ClusterCapacityProviders
    name: cluster-capacity-providers
    properties:
      default_capacity_provider_strategies:
        - { capacity_provider: FARGATE, base: "${config.fargate_base}", weight: "${config.fargate_weight}" }
        - { capacity_provider: FARGATE_SPOT, weight: "${config.fargate_spot_weight}" }
  - type: aws:iam:Role
    name: task-shared-execution-role
    properties:
      secret_arn: ${aurora.orangejuicedb_credentials_secret_arn}
outputs:
  - name: cluster_arn
  - name: service_namespace_arn
  - name: task_shared_security_group_id
  - name: task_shared_execution_role_arn
"#;

const CERTIFICATES: &str = r#"name: certificates
description: Wildcard certificate validated through DNS
config:
  domain: example.com
  hosted_zone_id: Z0000000000000
resources:
  - type: aws:acm:Certificate
    name: certificate
    properties:
      domain_name: ${config.domain}
      subject_alternative_names: ["*.${config.domain}"]
      validation_method: DNS
  - type: aws:route53:Record
    name: wildcard-validation-record
    properties:
      ttl: 300
      zone_id: ${config.hosted_zone_id}
  - type: aws:acm:CertificateValidation
    name: domain-cert-validation
outputs:
  - name: root_domain_certificate_arn
"#;

const LOAD_BALANCER: &str = r#"name: load_balancer
description: Public application load balancer
inputs:
  - stack: vpc
    outputs: [vpc_id, public_subnet_ids]
  - stack: certificates
    outputs: [root_domain_certificate_arn]
resources:
  - type: aws:ec2:SecurityGroup
    name: load-balancer-security-group
    properties:
      vpc_id: ${vpc.vpc_id}
  - type: aws:lb:LoadBalancer
    name: load-balancer
    properties:
      load_balancer_type: application
      subnets: ${vpc.public_subnet_ids}
  - type: aws:lb:TargetGroup
    name: target-group
    properties:
      port: 80
      protocol: HTTP
      target_type: ip
      vpc_id: ${vpc.vpc_id}
  - type: aws:lb:Listener
    name: https-listener
    properties:
      port: 443
      certificate_arn: ${certificates.root_domain_certificate_arn}
outputs:
  - name: load_balancer_arn
  - name: load_balancer_dns_name
  - name: load_balancer_zone_id
  - name: load_balancer_security_group_id
  - name: http_listener_arn
  - name: https_listener_arn
  - name: target_group_arn
"#;

const USERS_API: &str = r#"name: users-api
project: backend
description: Users CRUD service
inputs:
  - stack: vpc
    outputs: [vpc_id, public_subnet_ids]
  - stack: ecs
    outputs: [cluster_arn, task_shared_security_group_id, task_shared_execution_role_arn]
  - stack: load_balancer
    outputs: [target_group_arn]
  - stack: aurora
    outputs: [orangejuicedb_credentials_secret_arn]
config:
  desired_count: 1
resources:
  - type: aws:ecr:Repository
    name: repo
    properties:
      force_delete: true
  - type: aws:ecs:TaskDefinition
    name: users-api-task
    properties:
      execution_role_arn: ${ecs.task_shared_execution_role_arn}
      secrets:
        - name: DB_CREDENTIALS
          value_from: ${aurora.orangejuicedb_credentials_secret_arn}
  - type: aws:ecs:Service
    name: users-api-service
    properties:
      cluster: ${ecs.cluster_arn}
      desired_count: ${config.desired_count}
      subnets: ${vpc.public_subnet_ids}
      security_groups: ["${ecs.task_shared_security_group_id}"]
      target_group_arn: ${load_balancer.target_group_arn}
outputs:
  - name: service_name
  - name: image_repository_url
exports:
  service_name: users-api-${env}
"#;

const REVIEWS_API: &str = r#"name: reviews-api
project: backend
description: Reviews CRUD service
inputs:
  - stack: vpc
    outputs: [vpc_id, public_subnet_ids]
  - stack: ecs
    outputs: [cluster_arn, task_shared_security_group_id, task_shared_execution_role_arn]
  - stack: load_balancer
    outputs: [https_listener_arn]
  - stack: aurora
    outputs: [orangejuicedb_credentials_secret_arn]
config:
  desired_count: 1
  path_pattern: /reviews*
resources:
  - type: aws:ecr:Repository
    name: repo
    properties:
      force_delete: true
  - type: aws:lb:ListenerRule
    name: reviews-api-listener-rule
    properties:
      listener_arn: ${load_balancer.https_listener_arn}
      path_pattern: ${config.path_pattern}
  - type: aws:ecs:TaskDefinition
    name: reviews-api-task
    properties:
      execution_role_arn: ${ecs.task_shared_execution_role_arn}
      secrets:
        - name: DB_CREDENTIALS
          value_from: ${aurora.orangejuicedb_credentials_secret_arn}
  - type: aws:ecs:Service
    name: reviews-api-service
    properties:
      cluster: ${ecs.cluster_arn}
      desired_count: ${config.desired_count}
      subnets: ${vpc.public_subnet_ids}
      security_groups: ["${ecs.task_shared_security_group_id}"]
outputs:
  - name: service_name
  - name: image_repository_url
exports:
  service_name: reviews-api-${env}
"#;

const GITHUB: &str = r#"name: github
description: OIDC role for continuous delivery from GitHub Actions
resources:
  - type: aws:iam:OpenIdConnectProvider
    name: github
    properties:
      url: https://token.actions.githubusercontent.com
      client_id_lists: [sts.amazonaws.com]
  - type: aws:iam:Role
    name: github-actions-role
    properties:
      description: Continuous delivery via GitHub Actions
outputs:
  - name: role_arn
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DependencyGraph, Stack};

    fn stacks() -> Vec<Stack> {
        SAMPLE_MANIFESTS
            .iter()
            .map(|(_, yaml)| serde_yaml::from_str(yaml).unwrap())
            .collect()
    }

    #[test]
    fn sample_manifests_are_valid() {
        for ((name, _), stack) in SAMPLE_MANIFESTS.iter().zip(stacks()) {
            assert_eq!(stack.name.as_str(), *name);
            stack.validate().unwrap();
        }
    }

    #[test]
    fn sample_topology_orders_like_declaration() {
        let stacks = stacks();
        let graph = DependencyGraph::from_stacks(&stacks).unwrap();
        let order: Vec<_> = graph
            .execution_order()
            .unwrap()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(order, SAMPLE_ORDER);
    }

    #[test]
    fn aurora_secret_is_sensitive() {
        let aurora = stacks().into_iter().find(|s| s.name.as_str() == "aurora").unwrap();
        assert!(aurora.outputs.field("orangejuicedb_credentials_secret_arn").unwrap().sensitive);
    }
}
