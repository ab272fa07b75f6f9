//! Static platform objects for the CSI driver
//!
//! Everything here is plain data assembled once at startup: the CSI driver
//! registration, service accounts, RBAC, the controller `StatefulSet` and the
//! node `DaemonSet`. Storage classes are rendered per declared class.

use crate::config::OperatorConfig;
use crate::crd::StorageClassSpec;
use crate::domain::ports::ObjectRef;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet, StatefulSet,
    StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction,
    HostPathVolumeSource, Lifecycle, LifecycleHandler, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretVolumeSource, SecurityContext, ServiceAccount,
    Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec, StorageClass};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

// =============================================================================
// Constants
// =============================================================================

pub const CSI_PLUGIN_IMAGE: &str = "docker.lightbitslabs.com/lightos-csi/lb-csi-plugin:1.9.0";
pub const DISCOVERY_CLIENT_IMAGE: &str =
    "docker.lightbitslabs.com/lightos-csi/lb-nvme-discovery-client:1.9.0";
pub const CSI_PROVISIONER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-provisioner:v2.2.2";
pub const CSI_ATTACHER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-attacher:v3.5.0";
pub const CSI_RESIZER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-resizer:v1.5.0";
pub const CSI_REGISTRAR_IMAGE: &str =
    "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.5.1";
pub const BUSYBOX_IMAGE: &str = "busybox:1.36";

/// Name of the controller `StatefulSet`
pub const CONTROLLER_NAME: &str = "blockstore-csi-controller";
/// Name of the node `DaemonSet`
pub const NODE_NAME: &str = "blockstore-csi-node";

pub const CONTROLLER_SERVICE_ACCOUNT: &str = "blockstore-csi-ctrl-sa";
pub const NODE_SERVICE_ACCOUNT: &str = "blockstore-csi-node-sa";

/// Label put on every object the operator writes
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

const DO_NOT_EDIT: &str = "DO NOT EDIT - This resource is managed by blockstore-operator. \
Any modifications are discarded and the resource is returned to the original state.";

const CONTROLLER_SOCKET_DIR: &str = "/var/lib/csi/sockets/pluginproxy/";

// =============================================================================
// Managed Manifests
// =============================================================================

/// The fixed set of platform objects that run the CSI driver
#[derive(Debug, Clone)]
pub struct ManagedManifests {
    pub csi_driver: CSIDriver,
    pub service_accounts: Vec<ServiceAccount>,
    pub cluster_roles: Vec<ClusterRole>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub controller: StatefulSet,
    pub node: DaemonSet,
    namespace: String,
    provisioner: String,
    token_secret: String,
    mgmt_endpoints: String,
}

impl ManagedManifests {
    pub fn new(config: &OperatorConfig) -> Self {
        let ns = config.workload_namespace.as_str();
        let secret = config.token_secret_name.as_str();

        let csi_driver = CSIDriver {
            metadata: meta(&config.provisioner, None),
            spec: CSIDriverSpec {
                attach_required: Some(true),
                pod_info_on_mount: Some(true),
                ..Default::default()
            },
        };

        let service_accounts = vec![
            ServiceAccount {
                metadata: meta(CONTROLLER_SERVICE_ACCOUNT, Some(ns)),
                ..Default::default()
            },
            ServiceAccount {
                metadata: meta(NODE_SERVICE_ACCOUNT, Some(ns)),
                ..Default::default()
            },
        ];

        let cluster_roles = vec![
            cluster_role(
                "blockstore-csi-provisioner-role",
                vec![
                    rule("", &["secrets"], &["get", "list"]),
                    rule("", &["persistentvolumes"], &["get", "list", "watch", "create", "delete"]),
                    rule("", &["persistentvolumeclaims"], &["get", "list", "watch", "update"]),
                    rule("storage.k8s.io", &["storageclasses", "csinodes"], &["get", "list", "watch"]),
                    rule("", &["events"], &["list", "watch", "create", "update", "patch"]),
                    rule("", &["nodes"], &["get", "list", "watch"]),
                ],
            ),
            cluster_role(
                "blockstore-csi-attacher-role",
                vec![
                    rule(
                        "",
                        &["persistentvolumes"],
                        &["get", "list", "watch", "create", "delete", "patch"],
                    ),
                    rule("", &["nodes"], &["get", "list", "watch"]),
                    rule("storage.k8s.io", &["csinodes"], &["get", "list", "watch"]),
                    rule(
                        "storage.k8s.io",
                        &["volumeattachments", "volumeattachments/status"],
                        &["get", "list", "watch", "update", "patch"],
                    ),
                ],
            ),
            cluster_role(
                "blockstore-csi-resizer-role",
                vec![
                    rule("", &["persistentvolumes"], &["get", "list", "watch", "create", "delete"]),
                    rule("", &["persistentvolumeclaims"], &["get", "list", "watch", "update"]),
                    rule("", &["persistentvolumeclaims/status"], &["patch"]),
                    rule("", &["events"], &["list", "watch", "create", "update", "patch"]),
                    rule("", &["pods"], &["get", "list", "watch"]),
                ],
            ),
            cluster_role(
                "blockstore-csi-node-role",
                vec![rule("", &["nodes"], &["get"])],
            ),
        ];

        let cluster_role_bindings = vec![
            binding("blockstore-csi-provisioner-binding", "blockstore-csi-provisioner-role", CONTROLLER_SERVICE_ACCOUNT, ns),
            binding("blockstore-csi-attacher-binding", "blockstore-csi-attacher-role", CONTROLLER_SERVICE_ACCOUNT, ns),
            binding("blockstore-csi-resizer-binding", "blockstore-csi-resizer-role", CONTROLLER_SERVICE_ACCOUNT, ns),
            binding("blockstore-csi-node-binding", "blockstore-csi-node-role", NODE_SERVICE_ACCOUNT, ns),
        ];

        Self {
            csi_driver,
            service_accounts,
            cluster_roles,
            cluster_role_bindings,
            controller: controller_stateful_set(ns, secret),
            node: node_daemon_set(ns, secret, &config.provisioner),
            namespace: ns.to_string(),
            provisioner: config.provisioner.clone(),
            token_secret: secret.to_string(),
            mgmt_endpoints: config.endpoints.to_string(),
        }
    }

    /// Namespace of the workloads and the token secret
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Render the storage class for one declared class
    pub fn storage_class(&self, project: &str, class: &StorageClassSpec) -> StorageClass {
        let mut metadata = meta(&class.name, None);
        metadata.annotations = Some(BTreeMap::from([(
            "blockstore.io/description".to_string(),
            DO_NOT_EDIT.to_string(),
        )]));

        StorageClass {
            metadata,
            provisioner: self.provisioner.clone(),
            allow_volume_expansion: Some(true),
            parameters: Some(self.storage_class_parameters(project, class)),
            ..Default::default()
        }
    }

    /// Provisioner parameters of a storage class
    pub fn storage_class_parameters(
        &self,
        project: &str,
        class: &StorageClassSpec,
    ) -> BTreeMap<String, String> {
        let compression = if class.compression { "enabled" } else { "disabled" };
        let mut params = BTreeMap::from([
            ("mgmt-scheme".to_string(), "grpcs".to_string()),
            ("compression".to_string(), compression.to_string()),
            ("mgmt-endpoint".to_string(), self.mgmt_endpoints.clone()),
            ("project-name".to_string(), project.to_string()),
            ("replica-count".to_string(), class.replica_count.to_string()),
            ("csi.storage.k8s.io/fstype".to_string(), "ext4".to_string()),
        ]);
        for stage in [
            "controller-expand",
            "controller-publish",
            "node-publish",
            "node-stage",
            "provisioner",
        ] {
            params.insert(
                format!("csi.storage.k8s.io/{}-secret-name", stage),
                self.token_secret.clone(),
            );
            params.insert(
                format!("csi.storage.k8s.io/{}-secret-namespace", stage),
                self.namespace.clone(),
            );
        }
        params
    }

    /// Every static object, in creation order
    pub fn object_refs(&self) -> Vec<ObjectRef> {
        let ns = Some(self.namespace.as_str());
        let mut refs = vec![ObjectRef::of::<CSIDriver>(None, &self.provisioner)];
        refs.extend(
            self.service_accounts
                .iter()
                .map(|sa| ObjectRef::of::<ServiceAccount>(ns, &name_of(&sa.metadata))),
        );
        refs.extend(
            self.cluster_roles
                .iter()
                .map(|r| ObjectRef::of::<ClusterRole>(None, &name_of(&r.metadata))),
        );
        refs.extend(
            self.cluster_role_bindings
                .iter()
                .map(|b| ObjectRef::of::<ClusterRoleBinding>(None, &name_of(&b.metadata))),
        );
        refs.push(ObjectRef::of::<StatefulSet>(ns, CONTROLLER_NAME));
        refs.push(ObjectRef::of::<DaemonSet>(ns, NODE_NAME));
        refs
    }
}

pub(crate) fn name_of(metadata: &ObjectMeta) -> String {
    metadata.name.clone().unwrap_or_default()
}

// =============================================================================
// Builders
// =============================================================================

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        MANAGED_BY_LABEL.to_string(),
        crate::config::FIELD_MANAGER.to_string(),
    )])
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(managed_labels()),
        ..Default::default()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn rule(group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

fn cluster_role(name: &str, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: meta(name, None),
        rules: Some(rules),
        ..Default::default()
    }
}

fn binding(name: &str, role: &str, service_account: &str, namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: meta(name, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_node_name() -> EnvVar {
    EnvVar {
        name: "KUBE_NODE_NAME".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "spec.nodeName".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn host_path(name: &str, path: &str, kind: Option<&str>) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: kind.map(str::to_string),
        }),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn token_volume(secret: &str) -> Volume {
    Volume {
        name: "etc-csi".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resources() -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(quantities("100m", "100M")),
        limits: Some(quantities("200m", "200M")),
        ..Default::default()
    }
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        allow_privilege_escalation: Some(true),
        capabilities: Some(Capabilities {
            add: Some(strings(&["SYS_ADMIN"])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container(name: &str, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        resources: Some(resources()),
        ..Default::default()
    }
}

fn sidecar(name: &str, image: &str, verbosity: u8) -> Container {
    Container {
        args: Some(vec![
            "--csi-address=$(ADDRESS)".to_string(),
            format!("--v={}", verbosity),
        ]),
        env: Some(vec![env("ADDRESS", "/var/lib/csi/sockets/pluginproxy/csi.sock")]),
        volume_mounts: Some(vec![mount("socket-dir", CONTROLLER_SOCKET_DIR)]),
        ..container(name, image)
    }
}

fn plugin_env(endpoint: &str, role: &str) -> Vec<EnvVar> {
    let suffix = if role == "controller" { "ctrl" } else { "node" };
    vec![
        env("CSI_ENDPOINT", endpoint),
        env_node_name(),
        env("LB_CSI_NODE_ID", &format!("$(KUBE_NODE_NAME).{}", suffix)),
        env("LB_CSI_LOG_LEVEL", "info"),
        env("LB_CSI_LOG_ROLE", role),
        env("LB_CSI_LOG_FMT", "text"),
    ]
}

fn selector(labels: &BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn controller_stateful_set(namespace: &str, secret: &str) -> StatefulSet {
    let labels = BTreeMap::from([
        ("app".to_string(), CONTROLLER_NAME.to_string()),
        ("role".to_string(), "controller".to_string()),
    ]);

    let plugin = Container {
        args: Some(strings(&["-P"])),
        env: Some(plugin_env(
            "unix:///var/lib/csi/sockets/pluginproxy/csi.sock",
            "controller",
        )),
        volume_mounts: Some(vec![
            mount("socket-dir", CONTROLLER_SOCKET_DIR),
            mount("etc-csi", "/etc/lb-csi/"),
        ]),
        ..container("csi-plugin", CSI_PLUGIN_IMAGE)
    };

    StatefulSet {
        metadata: meta(CONTROLLER_NAME, Some(namespace)),
        spec: Some(StatefulSetSpec {
            selector: selector(&labels),
            service_name: "blockstore-csi-ctrl-svc".to_string(),
            replicas: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![
                        plugin,
                        sidecar("csi-provisioner", CSI_PROVISIONER_IMAGE, 4),
                        sidecar("csi-attacher", CSI_ATTACHER_IMAGE, 5),
                        sidecar("csi-resizer", CSI_RESIZER_IMAGE, 4),
                    ],
                    service_account_name: Some(CONTROLLER_SERVICE_ACCOUNT.to_string()),
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    volumes: Some(vec![empty_dir("socket-dir"), token_volume(secret)]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node_daemon_set(namespace: &str, secret: &str, provisioner: &str) -> DaemonSet {
    let labels = BTreeMap::from([
        ("app".to_string(), NODE_NAME.to_string()),
        ("role".to_string(), "node".to_string()),
    ]);
    let plugin_dir = format!("/var/lib/kubelet/plugins/{}", provisioner);

    let init = Container {
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "[ -e /sys/module/nvme_tcp ] && modinfo nvme_tcp || \
             { modinfo nvme_tcp && modprobe nvme_tcp ; } || \
             { echo \"FAILED to load nvme-tcp kernel driver\" && exit 1 ; }"
                .to_string(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            mount_propagation: Some("HostToContainer".to_string()),
            ..mount("modules-dir", "/lib/modules")
        }]),
        ..container("init-nvme-tcp", BUSYBOX_IMAGE)
    };

    let plugin = Container {
        args: Some(strings(&["-P"])),
        env: Some(plugin_env("unix:///csi/csi.sock", "node")),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![
            mount("plugin-dir", "/csi"),
            VolumeMount {
                mount_propagation: Some("Bidirectional".to_string()),
                ..mount("pods-mount-dir", "/var/lib/kubelet")
            },
            mount("device-dir", "/dev"),
            mount("discovery-client-dir", "/etc/discovery-client/discovery.d"),
            mount("etc-csi", "/etc/lb-csi/"),
        ]),
        ..container("csi-plugin", CSI_PLUGIN_IMAGE)
    };

    let registrar = Container {
        args: Some(strings(&[
            "--v=4",
            "--csi-address=$(ADDRESS)",
            "--kubelet-registration-path=$(DRIVER_REG_SOCK_PATH)",
        ])),
        env: Some(vec![
            env("ADDRESS", "/csi/csi.sock"),
            env("DRIVER_REG_SOCK_PATH", &format!("{}/csi.sock", plugin_dir)),
            env_node_name(),
        ]),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        format!(
                            "rm -rf /registration/{p} /registration/{p}-reg.sock",
                            p = provisioner
                        ),
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount("plugin-dir", "/csi"),
            mount("registration-dir", "/registration/"),
        ]),
        ..container("csi-node-driver-registrar", CSI_REGISTRAR_IMAGE)
    };

    let discovery = Container {
        security_context: Some(privileged()),
        volume_mounts: Some(vec![
            mount("device-dir", "/dev"),
            mount("discovery-client-dir", "/etc/discovery-client/discovery.d"),
        ]),
        ..container("nvme-discovery-client", DISCOVERY_CLIENT_IMAGE)
    };

    DaemonSet {
        metadata: meta(NODE_NAME, Some(namespace)),
        spec: Some(DaemonSetSpec {
            selector: selector(&labels),
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDaemonSet {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![init]),
                    containers: vec![plugin, registrar, discovery],
                    service_account_name: Some(NODE_SERVICE_ACCOUNT.to_string()),
                    priority_class_name: Some("system-node-critical".to_string()),
                    host_network: Some(true),
                    volumes: Some(vec![
                        host_path(
                            "registration-dir",
                            "/var/lib/kubelet/plugins_registry/",
                            Some("DirectoryOrCreate"),
                        ),
                        host_path("plugin-dir", &plugin_dir, Some("DirectoryOrCreate")),
                        host_path("pods-mount-dir", "/var/lib/kubelet", Some("Directory")),
                        host_path("device-dir", "/dev", None),
                        host_path("modules-dir", "/lib/modules", None),
                        empty_dir("discovery-client-dir"),
                        token_volume(secret),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifests() -> ManagedManifests {
        let config = OperatorConfig {
            endpoints: "10.0.0.1:443,10.0.0.2:443".parse().unwrap(),
            ..Default::default()
        };
        ManagedManifests::new(&config)
    }

    #[test]
    fn test_storage_class_parameters() {
        let manifests = manifests();
        let class = StorageClassSpec {
            name: "gold".into(),
            replica_count: 3,
            compression: true,
        };
        let sc = manifests.storage_class("project-a", &class);
        let params = sc.parameters.unwrap();

        assert_eq!(sc.provisioner, crate::config::DEFAULT_PROVISIONER);
        assert_eq!(sc.allow_volume_expansion, Some(true));
        assert_eq!(params["mgmt-scheme"], "grpcs");
        assert_eq!(params["compression"], "enabled");
        assert_eq!(params["mgmt-endpoint"], "10.0.0.1:443,10.0.0.2:443");
        assert_eq!(params["project-name"], "project-a");
        assert_eq!(params["replica-count"], "3");
        assert_eq!(
            params["csi.storage.k8s.io/node-stage-secret-name"],
            crate::config::DEFAULT_TOKEN_SECRET
        );
        assert_eq!(
            params["csi.storage.k8s.io/provisioner-secret-namespace"],
            "kube-system"
        );
    }

    #[test]
    fn test_workloads_reference_token_secret() {
        let manifests = manifests();
        let volumes = manifests
            .controller
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.volumes.clone())
            .unwrap();
        let secret = volumes.iter().find_map(|v| v.secret.as_ref()).unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some(crate::config::DEFAULT_TOKEN_SECRET));
        assert_eq!(manifests.controller.spec.as_ref().unwrap().replicas, Some(1));
    }

    #[test]
    fn test_object_refs_cover_static_objects() {
        let manifests = manifests();
        let refs = manifests.object_refs();
        assert_eq!(refs.len(), 1 + 2 + 4 + 4 + 2);
        assert!(refs.iter().all(|r| !r.name.is_empty()));
        assert_eq!(refs.last().unwrap().name, NODE_NAME);
    }
}
