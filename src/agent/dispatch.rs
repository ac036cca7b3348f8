//! Bus-input dispatch table
//!
//! Built once at startup from the templates' `triggers`: every topic filter
//! maps to the routes that start a workflow when an event arrives on it.

use crate::bus::EventHandler;
use crate::protocol::{canonicalize_topic, BusEvent};
use crate::rules::{Converter, RulerConfig};
use crate::workflow::{WorkflowEngine, WorkflowTemplate};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One template started by events on a topic
#[derive(Debug, Clone)]
pub struct TriggerRoute {
    pub template_id: String,
    /// Ruler applied to the event payload before the requirement check
    pub converter: Option<Arc<Converter>>,
    pub require: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    routes: BTreeMap<String, Vec<TriggerRoute>>,
}

impl DispatchTable {
    pub fn build(
        templates: &[WorkflowTemplate],
        rulers: &HashMap<String, RulerConfig>,
    ) -> Result<Self, String> {
        let mut compiled: HashMap<&str, Arc<Converter>> = HashMap::new();
        let mut routes: BTreeMap<String, Vec<TriggerRoute>> = BTreeMap::new();

        for template in templates {
            for trigger in &template.triggers {
                let converter = match &trigger.ruler {
                    Some(name) => {
                        if let Some(converter) = compiled.get(name.as_str()) {
                            Some(converter.clone())
                        } else {
                            let (key, ruler) = rulers.get_key_value(name).ok_or_else(|| {
                                format!(
                                    "workflow '{}' trigger references unknown ruler '{name}'",
                                    template.id
                                )
                            })?;
                            let converter = Arc::new(
                                Converter::from_rulers([ruler])
                                    .map_err(|e| format!("ruler '{name}': {e}"))?,
                            );
                            compiled.insert(key.as_str(), converter.clone());
                            Some(converter)
                        }
                    }
                    None => None,
                };

                routes
                    .entry(canonicalize_topic(&trigger.topic))
                    .or_default()
                    .push(TriggerRoute {
                        template_id: template.id.clone(),
                        converter,
                        require: trigger.require.clone(),
                    });
            }
        }
        Ok(Self { routes })
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn routes(&self, filter: &str) -> &[TriggerRoute] {
        self.routes.get(filter).map_or(&[], Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }
}

/// Bus handler starting the workflows routed on one filter
pub struct TriggerHandler {
    engine: WorkflowEngine,
    routes: Vec<TriggerRoute>,
}

impl TriggerHandler {
    pub fn new(engine: WorkflowEngine, routes: Vec<TriggerRoute>) -> Self {
        Self { engine, routes }
    }
}

#[async_trait]
impl EventHandler for TriggerHandler {
    async fn handle(&self, event: &BusEvent) {
        for route in &self.routes {
            let mut payload = event.payload.clone();
            if let Some(converter) = &route.converter {
                for error in converter.apply_in_place(&mut payload) {
                    debug!(
                        event_id = %event.id,
                        template = %route.template_id,
                        error = %error,
                        "Trigger ruler step failed"
                    );
                }
            }

            match self
                .engine
                .trigger(&route.template_id, payload, &route.require)
                .await
            {
                Ok(instance) => info!(
                    event_id = %event.id,
                    topic = %event.topic,
                    template = %route.template_id,
                    instance_id = %instance.id,
                    state = %instance.state,
                    "Workflow triggered"
                ),
                Err(e) => warn!(
                    event_id = %event.id,
                    template = %route.template_id,
                    error = %e,
                    "Failed to trigger workflow"
                ),
            }
        }
    }
}
