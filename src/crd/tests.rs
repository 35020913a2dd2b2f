//! Unit tests for StackSpec validation
//!
//! Tests the `StackSpec::validate()` function to ensure it correctly
//! accepts valid stacks and rejects invalid ones.

#[cfg(test)]
mod stack_spec_validation {
    use std::collections::BTreeMap;

    use crate::crd::{
        ConfigObjSpec, DeployConfig, DeployMode, FileReference, PortProtocol, ServiceConfig,
        ServicePortConfig, ServiceVolumeConfig, SpecValidationError, StackSpec, VolumeType,
    };

    fn service(name: &str, image: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// Helper to create a minimal valid two-service stack
    fn valid_spec() -> StackSpec {
        let mut front = service("front", "nginx:1.27");
        front.ports = vec![ServicePortConfig {
            target: 80,
            published: Some(8080),
            protocol: PortProtocol::TCP,
        }];
        front.configs = vec![FileReference {
            source: "nginx-conf".to_string(),
            target: Some("/etc/nginx/nginx.conf".to_string()),
        }];

        let mut db = service("db", "postgres:16");
        db.volumes = vec![ServiceVolumeConfig {
            source: Some("data".to_string()),
            target: "/var/lib/postgresql/data".to_string(),
            type_: VolumeType::Volume,
            read_only: false,
        }];

        StackSpec {
            services: vec![front, db],
            configs: BTreeMap::from([(
                "nginx-conf".to_string(),
                ConfigObjSpec {
                    data: BTreeMap::from([("nginx.conf".to_string(), "events {}".to_string())]),
                    external: false,
                },
            )]),
            secrets: BTreeMap::new(),
        }
    }

    fn has_error(errors: &[SpecValidationError], field: &str) -> bool {
        errors.iter().any(|e| e.field == field)
    }

    #[test]
    fn test_valid_spec_passes_validation() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_empty_stack_is_valid() {
        assert!(StackSpec::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_service_name_fails() {
        let mut spec = valid_spec();
        spec.services[0].name = "Front_End".to_string();

        let errors = spec.validate().unwrap_err();
        assert!(has_error(&errors, "spec.services[0].name"));
    }

    #[test]
    fn test_service_name_too_long_fails() {
        let mut spec = valid_spec();
        spec.services[0].name = "a".repeat(54);

        let errors = spec.validate().unwrap_err();
        assert!(has_error(&errors, "spec.services[0].name"));
    }

    #[test]
    fn test_duplicate_service_fails() {
        let mut spec = valid_spec();
        spec.services[1].name = "front".to_string();

        let errors = spec.validate().unwrap_err();
        assert!(errors.iter().any(|e| {
            e.field == "spec.services[1].name" && e.message.contains("more than once")
        }));
    }

    #[test]
    fn test_missing_image_fails() {
        let mut spec = valid_spec();
        spec.services[1].image = "  ".to_string();

        let errors = spec.validate().unwrap_err();
        assert!(errors.iter().any(|e| {
            e == &SpecValidationError::new(
                "spec.services[1].image",
                "image must not be empty",
                "Set an image reference such as 'nginx:1.27'.",
            )
        }));
    }

    #[test]
    fn test_negative_replicas_fails() {
        let mut spec = valid_spec();
        spec.services[0].deploy.replicas = Some(-1);

        let errors = spec.validate().unwrap_err();
        assert!(has_error(&errors, "spec.services[0].deploy.replicas"));
    }

    #[test]
    fn test_replicas_with_global_mode_fails() {
        let mut spec = valid_spec();
        spec.services[0].deploy = DeployConfig {
            mode: DeployMode::Global,
            replicas: Some(2),
            ..Default::default()
        };

        let errors = spec.validate().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message == "replicas cannot be set for global services"));
    }

    #[test]
    fn test_port_out_of_range_fails() {
        let mut spec = valid_spec();
        spec.services[0].ports[0].target = 70000;

        let errors = spec.validate().unwrap_err();
        assert!(has_error(&errors, "spec.services[0].ports[0].target"));
    }

    #[test]
    fn test_same_port_published_twice_fails() {
        let mut spec = valid_spec();
        spec.services[0].ports.push(ServicePortConfig {
            target: 81,
            published: Some(8080),
            protocol: PortProtocol::TCP,
        });

        let errors = spec.validate().unwrap_err();
        assert!(has_error(&errors, "spec.services[0].ports[1].published"));
    }

    #[test]
    fn test_same_port_different_protocol_passes() {
        let mut spec = valid_spec();
        spec.services[0].ports.push(ServicePortConfig {
            target: 80,
            published: Some(8080),
            protocol: PortProtocol::UDP,
        });

        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_bind_mount_without_source_fails() {
        let mut spec = valid_spec();
        spec.services[1].volumes.push(ServiceVolumeConfig {
            source: None,
            target: "/host".to_string(),
            type_: VolumeType::Bind,
            read_only: true,
        });

        let errors = spec.validate().unwrap_err();
        assert!(has_error(&errors, "spec.services[1].volumes[1].source"));
    }

    #[test]
    fn test_undeclared_config_reference_fails() {
        let mut spec = valid_spec();
        spec.configs.clear();

        let errors = spec.validate().unwrap_err();
        assert!(errors.iter().any(|e| {
            e.field == "spec.services[0].configs[0].source"
                && e.message == "config 'nginx-conf' is not declared"
        }));
    }

    #[test]
    fn test_all_errors_are_reported() {
        let mut spec = valid_spec();
        spec.services[0].image.clear();
        spec.services[1].deploy.replicas = Some(-3);

        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_desired_replicas() {
        let mut svc = service("web", "nginx");
        assert_eq!(svc.desired_replicas(), 1);

        svc.deploy.replicas = Some(4);
        assert_eq!(svc.desired_replicas(), 4);

        svc.deploy.replicas = None;
        svc.deploy.mode = DeployMode::Global;
        assert_eq!(svc.desired_replicas(), 1);
    }

    #[test]
    fn test_named_volume_detection() {
        let spec = valid_spec();
        assert!(!spec.services[0].has_named_volumes());
        assert!(spec.services[1].has_named_volumes());
        assert!(spec.services[0].has_published_ports());
    }
}

#[cfg(test)]
mod stack_serialization {
    use crate::crd::{ConstraintOperator, DeployMode, PortProtocol, Stack, StackPhase};

    #[test]
    fn test_deserialize_compose_style_stack() {
        let yaml = r#"
apiVersion: compose.docker.com/v1alpha3
kind: Stack
metadata:
  name: app
  namespace: default
spec:
  services:
    - name: front
      image: nginx:1.27
      ports:
        - target: 80
          published: 8080
          protocol: udp
      deploy:
        mode: global
        placement:
          constraints:
            - key: node.labels.disk
              operator: "=="
              value: ssd
"#;
        let stack: Stack = serde_yaml::from_str(yaml).unwrap();
        let front = stack.spec.service("front").unwrap();

        assert_eq!(front.ports[0].protocol, PortProtocol::UDP);
        assert_eq!(front.deploy.mode, DeployMode::Global);
        assert_eq!(
            front.deploy.placement.constraints[0].operator,
            ConstraintOperator::Equal
        );
        assert!(stack.status.is_none());
    }

    #[test]
    fn test_status_phase_serializes_as_string() {
        let status = crate::crd::StackStatus::new(StackPhase::Failure, "conflict");
        let value = serde_json::to_value(&status).unwrap();

        assert_eq!(value["phase"], "Failure");
        assert_eq!(value["message"], "conflict");
        assert!(value.get("services").is_none());
    }
}
