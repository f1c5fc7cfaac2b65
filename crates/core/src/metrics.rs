use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ── Label types ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RuleOpLabels {
    pub op: RuleOp,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SynthesisLabels {
    pub outcome: SynthesisOutcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum RuleOp {
    Add,
    Update,
    Remove,
    Enable,
    Disable,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Rejected,
    PublishFailed,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum SynthesisOutcome {
    Success,
    Configuration,
    Telemetry,
    ContentParse,
    Transport,
}

impl EncodeLabelValue for RuleOp {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        let s = match self {
            RuleOp::Add => "add",
            RuleOp::Update => "update",
            RuleOp::Remove => "remove",
            RuleOp::Enable => "enable",
            RuleOp::Disable => "disable",
        };
        EncodeLabelValue::encode(&s, encoder)
    }
}

impl EncodeLabelValue for Outcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        let s = match self {
            Outcome::Ok => "ok",
            Outcome::Rejected => "rejected",
            Outcome::PublishFailed => "publish_failed",
        };
        EncodeLabelValue::encode(&s, encoder)
    }
}

impl EncodeLabelValue for SynthesisOutcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        let s = match self {
            SynthesisOutcome::Success => "success",
            SynthesisOutcome::Configuration => "configuration",
            SynthesisOutcome::Telemetry => "telemetry",
            SynthesisOutcome::ContentParse => "content_parse",
            SynthesisOutcome::Transport => "transport",
        };
        EncodeLabelValue::encode(&s, encoder)
    }
}

// ── Metrics ───────────────────────────────────────────────────────────────────

pub struct Metrics {
    // Rule store (guarder_rule_*)
    pub rule_operations: Family<RuleOpLabels, Counter>,
    pub active_rules: Gauge,

    // Rule synthesis (guarder_synthesis_*)
    pub synthesis_requests: Family<SynthesisLabels, Counter>,
    pub synthesis_tokens: Counter,

    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let rule_operations = Family::<RuleOpLabels, Counter>::default();
        let active_rules = Gauge::default();
        let synthesis_requests = Family::<SynthesisLabels, Counter>::default();
        let synthesis_tokens = Counter::default();

        {
            let guarder = registry.sub_registry_with_prefix("guarder");
            guarder.register(
                "rule_operations",
                "Rule store mutations by operation and outcome",
                rule_operations.clone(),
            );
            guarder.register(
                "active_rules",
                "Rules currently held in the catalogue",
                active_rules.clone(),
            );
            guarder.register(
                "synthesis_requests",
                "Rule synthesis requests by outcome",
                synthesis_requests.clone(),
            );
            guarder.register(
                "synthesis_tokens",
                "Tokens consumed by the generation service",
                synthesis_tokens.clone(),
            );
        }

        Self {
            rule_operations,
            active_rules,
            synthesis_requests,
            synthesis_tokens,
            registry,
        }
    }

    pub fn record_rule_op(&self, op: RuleOp, outcome: Outcome) {
        self.rule_operations
            .get_or_create(&RuleOpLabels { op, outcome })
            .inc();
    }

    pub fn record_synthesis(&self, outcome: SynthesisOutcome) {
        self.synthesis_requests
            .get_or_create(&SynthesisLabels { outcome })
            .inc();
    }
}
