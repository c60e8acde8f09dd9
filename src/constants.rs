//! # System Constants
//!
//! Fixed values that define the provisioner's defaults: job resource tiers,
//! identity labels stamped on every generated job, and the timing defaults for
//! polling, reloading and reconnecting.

/// Default values applied while parsing a job configuration document
pub mod job_defaults {
    /// Maximum job runtime in seconds
    pub const TIMEOUT_SECONDS: u64 = 3600;
    /// Poll period in seconds
    pub const INTERVAL_SECONDS: u64 = 60;
    /// Concurrency ceiling when none is configured
    pub const PARALLELISM: u32 = 10;
    /// Image tag when `imageVersion` is absent
    pub const IMAGE_VERSION: &str = "latest";
    /// Sentinel that disables admission control for a queue
    pub const UNLIMITED: &str = "unlimited";
}

/// Default resource requests and limits, merged per key under explicit values
pub mod resources {
    pub const REQUEST_CPU: &str = "10m";
    pub const REQUEST_MEMORY: &str = "56Mi";
    pub const LIMIT_CPU: &str = "25m";
    pub const LIMIT_MEMORY: &str = "96Mi";
}

/// Label keys and fixed identity label values
pub mod labels {
    pub const COMPONENT: &str = "app.kubernetes.io/component";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const NAME: &str = "app.kubernetes.io/name";
    pub const VERSION: &str = "app.kubernetes.io/version";
    pub const PART_OF: &str = "app.kubernetes.io/part-of";
    pub const JOB_GROUP: &str = "jobgroup";
    pub const JOB_ITEM: &str = "jobitem";

    pub const COMPONENT_VALUE: &str = "job";
    pub const MANAGED_BY_VALUE: &str = "goci-kubernetes-event-job";
    pub const JOB_GROUP_VALUE: &str = "kubernetes-event-jobs";

    /// Suffix appended to the queue alias for the `name` label
    pub const PROCESSOR_SUFFIX: &str = "-processor";
}

/// Generated job manifest constants
pub mod job_template {
    pub const CONTAINER_NAME: &str = "processor";
    pub const RESTART_POLICY: &str = "OnFailure";
    pub const BACKOFF_LIMIT: u32 = 5;
    pub const TTL_SECONDS_AFTER_FINISHED: u64 = 21600;
    /// Field selector matching jobs with at least one running pod
    pub const ACTIVE_JOBS_FIELD_SELECTOR: &str = "status.active=1";
}

/// Message secret constants
pub mod secret {
    /// Issuer written (base64) into every message secret
    pub const ISSUER: &str = "goci/kubernetes-event-job";
    pub const ISSUER_KEY: &str = "ISSUER";
    pub const TARGET_KEY: &str = "TARGET";
    pub const MESSAGE_KEY: &str = "MESSAGE";
    pub const CHECKSUM_KEY: &str = "CHECKSUM";
}

/// Process-level defaults
pub mod system {
    pub const DEFAULT_AMQP_HOST: &str = "localhost";
    pub const DEFAULT_AMQP_PORT: u16 = 5672;
    pub const DEFAULT_HEARTBEAT_SECONDS: u16 = 15;
    pub const DEFAULT_NAMESPACE: &str = "default";
    pub const DEFAULT_CONFIG_MAP_NAME: &str = "event-job-provisioner-configs";
    pub const DEFAULT_RELOAD_INTERVAL_SECONDS: u64 = 60;
    pub const DEFAULT_RECONNECT_BACKOFF_SECONDS: u64 = 10;
    pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
    /// Upper bound (exclusive) of the random backoff multiplier
    pub const RECONNECT_BACKOFF_MAX_FACTOR: f64 = 2.5;
    pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
    pub const CONNECTION_NAME: &str = "event-job-provisioner";

    /// `RELOAD_ENABLED` values that switch continuous reload off
    pub const RELOAD_DISABLED_VALUES: [&str; 4] = ["false", "0", "no", "off"];
}
