//! Mock actions shared across the integration suite. All of them are
//! scheduling-only: `execute` returns no outputs.

use std::sync::Arc;

use async_trait::async_trait;
use reflexgraph::config::{ActionConfig, Mode, Priority, Structure};
use reflexgraph::cortex::{Action, ActionError, ActionFactory};
use reflexgraph::transport::Entity;

struct ConfiguredAction {
    config: Entity,
}

#[async_trait]
impl Action for ConfiguredAction {
    fn config(&self) -> Entity {
        self.config.clone()
    }

    async fn execute(
        &self,
        _input: Entity,
        _dependency: &str,
        _context: &str,
        _job_id: i64,
    ) -> Result<Vec<Entity>, ActionError> {
        Ok(Vec::new())
    }
}

/// Wrap a prebuilt configuration into a factory.
pub fn configured(config: Entity) -> ActionFactory {
    Arc::new(move || {
        Box::new(ConfiguredAction {
            config: config.clone(),
        }) as Box<dyn Action>
    })
}

/// `Alpha [Primary, Set]` under a single dependency `alpha`.
pub fn alpha_set() -> ActionFactory {
    configured(
        ActionConfig::new("ActionAlphaSet")
            .category("Test")
            .dependency("alpha", Structure::new("Alpha").priority(Priority::Primary))
            .build(),
    )
}

/// `Alpha -> Beta -> Gamma -> Delta [Primary, Match]` with filters
/// `Value == "protoX"` and `Properties.Transport == "secure"`.
pub fn deep_match() -> ActionFactory {
    configured(
        ActionConfig::new("ActionDeepMatch")
            .category("Test")
            .dependency(
                "deepMatch",
                Structure::new("Alpha").child(Structure::new("Beta").child(
                    Structure::new("Gamma").child(
                        Structure::new("Delta")
                            .priority(Priority::Primary)
                            .mode(Mode::Match)
                            .filter("proto", "Value", "==", "protoX")
                            .filter("transport", "Properties.Transport", "==", "secure"),
                    ),
                )),
            )
            .build(),
    )
}

/// `Root [Primary, Set]` with `Alpha`, `Beta`, `Gamma` children
/// (all Secondary, Set).
pub fn fanout() -> ActionFactory {
    configured(
        ActionConfig::new("ActionFanout")
            .category("Test")
            .dependency(
                "fanout",
                Structure::new("Root")
                    .priority(Priority::Primary)
                    .child(Structure::new("Alpha"))
                    .child(Structure::new("Beta"))
                    .child(Structure::new("Gamma")),
            )
            .build(),
    )
}

/// `Bucket [Secondary, Set] -> Item [Primary, Set]`.
pub fn bucket_item() -> ActionFactory {
    configured(
        ActionConfig::new("ActionBucketItem")
            .category("Test")
            .dependency(
                "bucketItem",
                Structure::new("Bucket")
                    .child(Structure::new("Item").priority(Priority::Primary)),
            )
            .build(),
    )
}

/// `Alpha [Secondary, Set] -> Beta [Primary, Set]`.
pub fn alpha_beta() -> ActionFactory {
    configured(
        ActionConfig::new("ActionAlphaBeta")
            .category("Test")
            .dependency(
                "alphaBeta",
                Structure::new("Alpha").child(Structure::new("Beta").priority(Priority::Primary)),
            )
            .build(),
    )
}

/// A five-level chain `L1 -> L2 -> L3 -> L4 -> L5 [Primary, Set]`.
pub fn chain_five() -> ActionFactory {
    configured(
        ActionConfig::new("ActionChainFive")
            .category("Test")
            .dependency(
                "chain",
                Structure::new("L1").child(Structure::new("L2").child(
                    Structure::new("L3").child(
                        Structure::new("L4")
                            .child(Structure::new("L5").priority(Priority::Primary)),
                    ),
                )),
            )
            .build(),
    )
}

/// Two independent dependencies on one action: `alpha` over `Alpha` and
/// `beta` over `Beta`.
pub fn multi_dependency() -> ActionFactory {
    configured(
        ActionConfig::new("ActionMulti")
            .category("Test")
            .dependency("alpha", Structure::new("Alpha").priority(Priority::Primary))
            .dependency("beta", Structure::new("Beta").priority(Priority::Primary))
            .build(),
    )
}
