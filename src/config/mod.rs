mod settings;

pub use settings::{
    ApexConfig, BudgetConfig, ControllerConfig, CoordinatorConfig, LlmConfig, RouterConfig,
    SwitchConfig, TopologyConfig,
};
