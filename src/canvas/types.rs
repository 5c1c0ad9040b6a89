use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current canvas wire-format version.
pub const CANVAS_VERSION: &str = "1";

fn default_version() -> String {
    CANVAS_VERSION.to_string()
}

/// The authored graph of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Canvas {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            version: default_version(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }
}

/// Node type tag. The set is closed; capability-backed kinds are resolved
/// against the registry at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Llm,
    Code,
    Input,
    QuestionAnswer,
    Selector,
    Loop,
    Batch,
    SubWorkflow,
    PluginCall,
    DatabaseOp,
    KnowledgeRetrieval,
    VariableAssigner,
    Message,
    Break,
    Continue,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Llm => "llm",
            NodeKind::Code => "code",
            NodeKind::Input => "input",
            NodeKind::QuestionAnswer => "question_answer",
            NodeKind::Selector => "selector",
            NodeKind::Loop => "loop",
            NodeKind::Batch => "batch",
            NodeKind::SubWorkflow => "sub_workflow",
            NodeKind::PluginCall => "plugin_call",
            NodeKind::DatabaseOp => "database_op",
            NodeKind::KnowledgeRetrieval => "knowledge_retrieval",
            NodeKind::VariableAssigner => "variable_assigner",
            NodeKind::Message => "message",
            NodeKind::Break => "break",
            NodeKind::Continue => "continue",
        }
    }

    /// Loop and Batch own an embedded subgraph.
    pub fn is_composite(self) -> bool {
        matches!(self, NodeKind::Loop | NodeKind::Batch)
    }

    /// Kinds whose execution is delegated to a registered capability provider.
    pub fn is_capability(self) -> bool {
        matches!(
            self,
            NodeKind::Llm
                | NodeKind::Code
                | NodeKind::Input
                | NodeKind::QuestionAnswer
                | NodeKind::PluginCall
                | NodeKind::DatabaseOp
                | NodeKind::KnowledgeRetrieval
        )
    }

    /// Kinds that always suspend waiting for a human.
    pub fn always_interrupts(self) -> bool {
        matches!(self, NodeKind::Input | NodeKind::QuestionAnswer)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default)]
    pub title: String,
    /// Canvas layout; ignored by structural comparisons.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub meta: NodeMeta,
    #[serde(default)]
    pub data: NodeData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
}

impl Node {
    pub fn title(&self) -> &str {
        if self.meta.title.is_empty() {
            &self.id
        } else {
            &self.meta.title
        }
    }

    /// Deserialize the kind-specific configuration block.
    pub fn config<T: serde::de::DeserializeOwned + Default>(&self) -> serde_json::Result<T> {
        if self.data.config.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.data.config.clone())
    }

    pub fn error_policy(&self) -> SettingOnError {
        self.data.setting_on_error.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub inputs: Vec<Param>,
    #[serde(default)]
    pub outputs: Vec<Variable>,
    /// Aggregated outputs of a composite node, each bound to an inner node output.
    #[serde(default, rename = "outputParams", skip_serializing_if = "Vec::is_empty")]
    pub output_params: Vec<Param>,
    /// Loop variables, readable as `<loop id>.<name>` and written by VariableAssigner.
    #[serde(default, rename = "variableParameters", skip_serializing_if = "Vec::is_empty")]
    pub loop_variables: Vec<Param>,
    #[serde(default, rename = "settingOnError", skip_serializing_if = "Option::is_none")]
    pub setting_on_error: Option<SettingOnError>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "sourceNodeID")]
    pub source: String,
    #[serde(rename = "targetNodeID")]
    pub target: String,
    #[serde(rename = "sourcePortID", default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(rename = "targetPortID", default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
}

impl Edge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            source_port: None,
            target_port: None,
        }
    }

    pub fn from_port(source: &str, port: &str, target: &str) -> Self {
        Self {
            source_port: Some(port.to_string()),
            ..Self::new(source, target)
        }
    }
}

/// Declared data types of parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    #[serde(alias = "float")]
    Number,
    Boolean,
    Image,
    Object,
    #[serde(alias = "array")]
    List,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Image => "image",
            DataType::Object => "object",
            DataType::List => "list",
        };
        f.write_str(s)
    }
}

/// A typed field declaration (node outputs, Start fields, nested schemas).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<VariableSchema>,
    #[serde(default, rename = "defaultValue", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, rename = "ignoreTypeError")]
    pub ignore_type_error: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Variable {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            required: false,
            schema: None,
            default_value: None,
            ignore_type_error: false,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_fields(mut self, fields: Vec<Variable>) -> Self {
        self.schema = Some(VariableSchema::Object(fields));
        self
    }

    pub fn with_items(mut self, item: Variable) -> Self {
        self.schema = Some(VariableSchema::List(Box::new(item)));
        self
    }
}

/// Object fields or list element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableSchema {
    Object(Vec<Variable>),
    List(Box<Variable>),
}

/// A named node input bound to a literal or a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub input: ValueSource,
    #[serde(default)]
    pub required: bool,
}

impl Param {
    pub fn literal(name: &str, data_type: DataType, value: Value) -> Self {
        Self {
            name: name.to_string(),
            input: ValueSource {
                data_type,
                schema: None,
                value: Some(BlockValue::Literal(value)),
            },
            required: false,
        }
    }

    pub fn reference(name: &str, data_type: DataType, block_id: &str, field: &str) -> Self {
        Self {
            name: name.to_string(),
            input: ValueSource {
                data_type,
                schema: None,
                value: Some(BlockValue::Ref(Reference {
                    block_id: block_id.to_string(),
                    name: field.to_string(),
                    path: Vec::new(),
                })),
            },
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSource {
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<VariableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<BlockValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum BlockValue {
    Literal(Value),
    Ref(Reference),
}

/// Points at `<blockID>.<name>[.path...]` in the execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "blockID")]
    pub block_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorProcessType {
    #[default]
    Throw,
    Default,
    ExceptionBranch,
}

/// Per-node timeout / retry / on-exhaustion policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SettingOnError {
    #[serde(default, rename = "processType")]
    pub process_type: ErrorProcessType,
    #[serde(default, rename = "retryTimes")]
    pub retry_times: u32,
    #[serde(default, rename = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// JSON text of the default output used when processType is `default`.
    #[serde(default, rename = "dataOnErr", skip_serializing_if = "Option::is_none")]
    pub data_on_err: Option<String>,
    /// Configuration merged over `config` on retry attempts (fallback provider).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<Value>,
}

// --- kind-specific configuration blocks ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminatePlan {
    #[default]
    ReturnVariables,
    UseAnswerContent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndConfig {
    #[serde(default)]
    pub terminate_plan: TerminatePlan,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageConfig {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    LengthGt,
    LengthGe,
    LengthLt,
    LengthLe,
    Contains,
    NotContains,
    Empty,
    NotEmpty,
    IsTrue,
    IsFalse,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    /// Unary operators take no right operand.
    pub fn is_unary(self) -> bool {
        matches!(
            self,
            Operator::Empty | Operator::NotEmpty | Operator::IsTrue | Operator::IsFalse
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub operator: Operator,
    pub left: ValueSource,
    #[serde(default)]
    pub right: Option<ValueSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub branches: Vec<Branch>,
}

impl SelectorConfig {
    /// Port of branch `i` (`true`, `true_1`, ...); `false` when none matches.
    pub fn port_for(index: Option<usize>) -> String {
        match index {
            Some(0) => "true".to_string(),
            Some(i) => format!("true_{}", i),
            None => "false".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopType {
    #[default]
    Array,
    Count,
    Infinite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(default)]
    pub loop_type: LoopType,
    #[serde(default)]
    pub loop_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    /// Maximum number of elements processed.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Iterations running at once.
    #[serde(default)]
    pub concurrent_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowConfig {
    #[serde(default)]
    pub workflow_id: String,
    /// Published version to call; latest published when absent.
    #[serde(default)]
    pub workflow_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerType {
    #[default]
    Text,
    Option,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    #[default]
    Static,
    Dynamic,
}

/// Options a question can offer; one per option ID `A`..`Z`.
pub const MAX_QUESTION_OPTIONS: usize = 26;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionConfig {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub answer_type: AnswerType,
    #[serde(default)]
    pub option_type: OptionType,
    #[serde(default)]
    pub options: Vec<String>,
}

impl QuestionConfig {
    /// Output ports the node may select.
    pub fn ports(&self) -> Vec<String> {
        if self.answer_type != AnswerType::Option {
            return Vec::new();
        }
        let count = match self.option_type {
            OptionType::Static => self.options.len(),
            OptionType::Dynamic => 1,
        };
        let mut ports: Vec<String> = (0..count).map(|i| format!("branch_{}", i)).collect();
        ports.push("default".to_string());
        ports
    }
}

/// A (workflow, version) pair referenced by a SubWorkflow node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowIdentity {
    pub id: String,
    pub version: Option<String>,
}

impl Canvas {
    /// All nodes, depth-first, including composite children.
    pub fn all_nodes(&self) -> Vec<&Node> {
        fn walk<'a>(nodes: &'a [Node], out: &mut Vec<&'a Node>) {
            for n in nodes {
                out.push(n);
                walk(&n.blocks, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }

    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.all_nodes().into_iter().find(|n| n.id == id)
    }

    /// The composite node directly containing `id`, if any.
    pub fn parent_of(&self, id: &str) -> Option<&Node> {
        self.all_nodes()
            .into_iter()
            .find(|n| n.blocks.iter().any(|b| b.id == id))
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Start)
    }

    pub fn sub_workflow_identities(&self) -> Vec<WorkflowIdentity> {
        self.all_nodes()
            .into_iter()
            .filter(|n| n.kind == NodeKind::SubWorkflow)
            .filter_map(|n| n.config::<SubWorkflowConfig>().ok())
            .filter(|c| !c.workflow_id.is_empty())
            .map(|c| WorkflowIdentity {
                id: c.workflow_id,
                version: c.workflow_version,
            })
            .collect()
    }

    /// Whether any node in this canvas (not following sub-workflows) suspends for input.
    pub fn has_interrupting_nodes(&self) -> bool {
        self.all_nodes()
            .into_iter()
            .any(|n| n.kind.always_interrupts())
    }

    /// Canonical JSON with layout stripped, used for diffing and commit IDs.
    pub fn structural_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        strip_layout(&mut value);
        value
    }
}

fn strip_layout(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::Object(meta)) = map.get_mut("meta") {
                meta.remove("position");
            }
            for v in map.values_mut() {
                strip_layout(v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_layout),
        _ => {}
    }
}

impl Node {
    /// Named output ports this node may choose between; empty when control
    /// always flows through the unnamed default edge.
    pub fn output_ports(&self) -> Vec<String> {
        let mut ports = match self.kind {
            NodeKind::Selector => {
                let branches = self
                    .config::<SelectorConfig>()
                    .map(|c| c.branches.len())
                    .unwrap_or(0);
                let mut ports: Vec<String> = (0..branches)
                    .map(|i| SelectorConfig::port_for(Some(i)))
                    .collect();
                ports.push(SelectorConfig::port_for(None));
                ports
            }
            NodeKind::QuestionAnswer => self
                .config::<QuestionConfig>()
                .map(|c| c.ports())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        if self.error_policy().process_type == ErrorProcessType::ExceptionBranch {
            for port in [PORT_DEFAULT, PORT_ERROR] {
                if !ports.iter().any(|p| p == port) {
                    ports.push(port.to_string());
                }
            }
        }
        ports
    }
}

/// Port taken on success by nodes that also expose an error branch.
pub const PORT_DEFAULT: &str = "default";
/// Port taken when a node with `exceptionBranch` policy exhausts its retries.
pub const PORT_ERROR: &str = "branch_error";
