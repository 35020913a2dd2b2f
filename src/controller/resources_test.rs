//! Unit tests for Kubernetes resource builders.
//!
//! Run with: `cargo test -p stack-controller resources_test`

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    use crate::config::PublishedServiceType;
    use crate::controller::keys::ChildKind;
    use crate::controller::resources::{
        desired_children, recorded_hash, DesiredChild, DesiredObject, MANAGED_BY_LABEL,
        SERVICE_LABEL, STACK_LABEL,
    };
    use crate::crd::{
        ConfigObjSpec, ConstraintOperator, DeployConfig, DeployMode, FileReference, Placement,
        PlacementConstraint, PortProtocol, SecretObjSpec, ServiceConfig, ServicePortConfig,
        ServiceVolumeConfig, Stack, StackSpec, VolumeType,
    };

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn service(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            image: format!("example/{name}:1"),
            ..Default::default()
        }
    }

    fn stack(services: Vec<ServiceConfig>) -> Stack {
        Stack {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-app".to_string()),
                ..Default::default()
            },
            spec: StackSpec {
                services,
                ..Default::default()
            },
            status: None,
        }
    }

    fn render(stack: &Stack) -> Vec<DesiredChild> {
        desired_children(stack, PublishedServiceType::LoadBalancer).unwrap()
    }

    fn find<'a>(children: &'a [DesiredChild], kind: ChildKind, name: &str) -> &'a DesiredChild {
        children
            .iter()
            .find(|c| c.key.kind == kind && c.key.name == name)
            .unwrap_or_else(|| panic!("{kind} {name} not rendered"))
    }

    // -----------------------------------------------------------------------
    // Child set
    // -----------------------------------------------------------------------

    #[test]
    fn test_single_service_renders_deployment_and_headless_service() {
        let children = render(&stack(vec![service("front")]));

        assert_eq!(children.len(), 2);
        assert_eq!(children[0].key.kind, ChildKind::Service);
        assert_eq!(children[1].key.kind, ChildKind::Deployment);
        assert_eq!(children[1].key.namespace, "default");

        let DesiredObject::Service(svc) = &children[0].object else {
            panic!("expected a Service");
        };
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert!(spec.ports.is_none());
    }

    #[test]
    fn test_children_carry_labels_and_owner() {
        let children = render(&stack(vec![service("front")]));

        for child in &children {
            let meta = child.object.meta();
            let labels = meta.labels.as_ref().unwrap();
            assert_eq!(labels.get(MANAGED_BY_LABEL).unwrap(), "stack-controller");
            assert_eq!(labels.get(STACK_LABEL).unwrap(), "app");
            assert_eq!(labels.get(SERVICE_LABEL).unwrap(), "front");

            let owner = &meta.owner_references.as_ref().unwrap()[0];
            assert_eq!(owner.kind, "Stack");
            assert_eq!(owner.uid, "uid-app");
            assert_eq!(owner.controller, Some(true));

            assert_eq!(recorded_hash(meta), Some(child.spec_hash.as_str()));
        }
    }

    #[test]
    fn test_published_ports_render_extra_service() {
        let mut front = service("front");
        front.ports = vec![
            ServicePortConfig {
                target: 80,
                published: Some(8080),
                protocol: PortProtocol::TCP,
            },
            ServicePortConfig {
                target: 9090,
                published: None,
                protocol: PortProtocol::TCP,
            },
        ];
        let children =
            desired_children(&stack(vec![front]), PublishedServiceType::NodePort).unwrap();

        let published = find(&children, ChildKind::Service, "front-published");
        let DesiredObject::Service(svc) = &published.object else {
            panic!("expected a Service");
        };
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let ports = spec.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 8080);

        let headless = find(&children, ChildKind::Service, "front");
        let DesiredObject::Service(svc) = &headless.object else {
            panic!("expected a Service");
        };
        assert_eq!(svc.spec.as_ref().unwrap().ports.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_shared_target_port_is_rendered_once() {
        let mut web = service("web");
        web.ports = vec![
            ServicePortConfig {
                target: 80,
                published: Some(8080),
                protocol: PortProtocol::TCP,
            },
            ServicePortConfig {
                target: 80,
                published: Some(8081),
                protocol: PortProtocol::TCP,
            },
            ServicePortConfig {
                target: 80,
                published: None,
                protocol: PortProtocol::UDP,
            },
        ];
        let children =
            desired_children(&stack(vec![web]), PublishedServiceType::LoadBalancer).unwrap();

        let headless = find(&children, ChildKind::Service, "web");
        let DesiredObject::Service(svc) = &headless.object else {
            panic!("expected a Service");
        };
        let names: Vec<_> = svc
            .spec
            .as_ref()
            .unwrap()
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["tcp-80", "udp-80"]);

        let workload = find(&children, ChildKind::Deployment, "web");
        let DesiredObject::Deployment(deployment) = &workload.object else {
            panic!("expected a Deployment");
        };
        let pod = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.ports.as_ref().unwrap().len(), 2);

        let published = find(&children, ChildKind::Service, "web-published");
        let DesiredObject::Service(svc) = &published.object else {
            panic!("expected a Service");
        };
        assert_eq!(svc.spec.as_ref().unwrap().ports.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_named_volume_renders_statefulset() {
        let mut db = service("db");
        db.volumes = vec![
            ServiceVolumeConfig {
                source: Some("data".to_string()),
                target: "/data".to_string(),
                type_: VolumeType::Volume,
                read_only: false,
            },
            ServiceVolumeConfig {
                source: None,
                target: "/scratch".to_string(),
                type_: VolumeType::Tmpfs,
                read_only: false,
            },
        ];
        let children = render(&stack(vec![db]));

        let workload = find(&children, ChildKind::StatefulSet, "db");
        let claims = workload.object.claim_templates().unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some("data"));

        let DesiredObject::StatefulSet(sts) = &workload.object else {
            panic!("expected a StatefulSet");
        };
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.service_name, "db");
        let pod = spec.template.spec.as_ref().unwrap();
        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(
            volumes[0].empty_dir.as_ref().unwrap().medium.as_deref(),
            Some("Memory")
        );
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].name, "data");
    }

    #[test]
    fn test_configs_and_secrets() {
        let mut front = service("front");
        front.configs = vec![FileReference {
            source: "site".to_string(),
            target: None,
        }];
        front.secrets = vec![FileReference {
            source: "token".to_string(),
            target: None,
        }];

        let mut s = stack(vec![front]);
        s.spec.configs = BTreeMap::from([(
            "site".to_string(),
            ConfigObjSpec {
                data: BTreeMap::from([("index.html".to_string(), "<h1>hi</h1>".to_string())]),
                external: false,
            },
        )]);
        s.spec.secrets = BTreeMap::from([(
            "token".to_string(),
            SecretObjSpec {
                data: BTreeMap::new(),
                external: true,
            },
        )]);
        let children = render(&s);

        // external secrets are referenced, never rendered
        assert!(children.iter().all(|c| c.key.kind != ChildKind::Secret));
        find(&children, ChildKind::ConfigMap, "app-site");

        let front = find(&children, ChildKind::Deployment, "front");
        let DesiredObject::Deployment(deploy) = &front.object else {
            panic!("expected a Deployment");
        };
        let pod = deploy.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().name.as_deref(),
            Some("app-site")
        );
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("token")
        );
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/site");
        assert_eq!(mounts[1].mount_path, "/run/secrets/token");
    }

    #[test]
    fn test_placement_constraints_become_node_affinity() {
        let mut front = service("front");
        front.deploy.placement = Placement {
            constraints: vec![
                PlacementConstraint {
                    key: "node.labels.disk".to_string(),
                    operator: ConstraintOperator::Equal,
                    value: "ssd".to_string(),
                },
                PlacementConstraint {
                    key: "node.platform.os".to_string(),
                    operator: ConstraintOperator::NotEqual,
                    value: "windows".to_string(),
                },
            ],
        };
        let children = render(&stack(vec![front]));

        let front = find(&children, ChildKind::Deployment, "front");
        let DesiredObject::Deployment(deploy) = &front.object else {
            panic!("expected a Deployment");
        };
        let affinity = deploy
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .affinity
            .clone()
            .unwrap();
        let terms = affinity
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        let expressions = terms[0].match_expressions.as_ref().unwrap();
        assert_eq!(expressions[0].key, "disk");
        assert_eq!(expressions[0].operator, "In");
        assert_eq!(expressions[1].key, "kubernetes.io/os");
        assert_eq!(expressions[1].operator, "NotIn");
    }

    // -----------------------------------------------------------------------
    // Spec hash
    // -----------------------------------------------------------------------

    #[test]
    fn test_hash_ignores_replicas() {
        let mut scaled = service("front");
        scaled.deploy = DeployConfig {
            replicas: Some(5),
            ..Default::default()
        };

        let before = render(&stack(vec![service("front")]));
        let after = render(&stack(vec![scaled]));

        let before = find(&before, ChildKind::Deployment, "front");
        let after = find(&after, ChildKind::Deployment, "front");
        assert_eq!(before.spec_hash, after.spec_hash);
        assert_eq!(before.object.replicas(), Some(1));
        assert_eq!(after.object.replicas(), Some(5));
    }

    #[test]
    fn test_hash_changes_with_image() {
        let mut updated = service("front");
        updated.image = "example/front:2".to_string();

        let before = render(&stack(vec![service("front")]));
        let after = render(&stack(vec![updated]));

        assert_ne!(
            find(&before, ChildKind::Deployment, "front").spec_hash,
            find(&after, ChildKind::Deployment, "front").spec_hash
        );
    }

    #[test]
    fn test_global_service_runs_one_replica() {
        let mut agent = service("agent");
        agent.deploy.mode = DeployMode::Global;
        let children = render(&stack(vec![agent]));

        assert_eq!(
            find(&children, ChildKind::Deployment, "agent").object.replicas(),
            Some(1)
        );
    }
}
