use serde::{Deserialize, Serialize};

/// Affine rule mapping a worker count to the resources requested from the
/// cluster scheduler: `cores = workers * cores_per_worker + base_cores`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceRule {
    #[serde(default = "default_cores_per_worker")]
    pub cores_per_worker: u32,
    #[serde(default = "default_base_cores")]
    pub base_cores: u32,
    #[serde(default = "default_gpus")]
    pub gpus: u32,
}

/// Resources for one job, handed to the scheduler and never to the
/// training program itself
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cores: u32,
    pub gpus: u32,
}

impl ResourceRule {
    pub fn request(&self, workers: u32) -> ResourceRequest {
        ResourceRequest {
            cores: workers
                .saturating_mul(self.cores_per_worker)
                .saturating_add(self.base_cores),
            gpus: self.gpus,
        }
    }
}

impl Default for ResourceRule {
    fn default() -> Self {
        Self {
            cores_per_worker: default_cores_per_worker(),
            base_cores: default_base_cores(),
            gpus: default_gpus(),
        }
    }
}

fn default_cores_per_worker() -> u32 {
    6
}

fn default_base_cores() -> u32 {
    3
}

fn default_gpus() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::{ResourceRequest, ResourceRule};

    #[test]
    fn default_rule() {
        let rule = ResourceRule::default();

        assert_eq!(rule.request(1), ResourceRequest { cores: 9, gpus: 1 });
        assert_eq!(rule.request(2), ResourceRequest { cores: 15, gpus: 1 });
        assert_eq!(rule.request(4).cores, 27);
    }

    #[test]
    fn partial_rule_from_yaml() {
        let rule: ResourceRule = serde_yaml::from_str("base_cores: 1").unwrap();

        assert_eq!(rule.cores_per_worker, 6);
        assert_eq!(rule.request(2), ResourceRequest { cores: 13, gpus: 1 });
    }
}
