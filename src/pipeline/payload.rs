//! Stage invocation and result payloads.
//!
//! Each stage has its own input schema. Inputs are assembled once at the
//! orchestration boundary from the request fields and upstream outputs, then
//! handed to the worker as a flat JSON object. Worker results are any JSON
//! object; the only key inspected is `error`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::PipelineRequest;
use super::stage::Stage;
use crate::error::StageError;

/// Fields every stage receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub id: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkerInput {
    #[serde(flatten)]
    pub context: RequestContext,
    pub docs_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDbInput {
    #[serde(flatten)]
    pub context: RequestContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_data: Option<String>,
    #[serde(default)]
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorDbInput {
    #[serde(flatten)]
    pub context: RequestContext,
    pub docs_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<String>,
    #[serde(rename = "vectorDB", default, skip_serializing_if = "Option::is_none")]
    pub vector_db: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptInput {
    #[serde(flatten)]
    pub context: RequestContext,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_text: Option<String>,
    pub kg: KnowledgeGraph,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmInput {
    #[serde(flatten)]
    pub context: RequestContext,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<String>,
    pub prompts: PromptSet,
}

/// Graph extraction output forwarded to prompt assembly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeGraph {
    #[serde(default)]
    pub kg_triples: Vec<Value>,
    #[serde(default)]
    pub ner: Vec<Value>,
}

impl KnowledgeGraph {
    /// Extracts the graph from a `graph_db` result, either at the top level
    /// or nested under `kg`.
    pub fn from_output(output: &Value) -> Result<Self, StageError> {
        let object = output.as_object().ok_or_else(|| {
            StageError::MalformedInput("graph_db output is not a JSON object".to_string())
        })?;
        let source = match object.get("kg") {
            Some(Value::Object(nested)) => nested,
            _ => object,
        };

        Ok(Self {
            kg_triples: array_field(source, "kgTriples", Stage::GraphDb)?,
            ner: array_field(source, "ner", Stage::GraphDb)?,
        })
    }
}

/// Prompt variants produced by prompt assembly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_shot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_based: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

impl PromptSet {
    /// Extracts prompts from a `prompt` result, nested under `prompts` or at
    /// the top level.
    pub fn from_output(output: &Value) -> Result<Self, StageError> {
        let object = output.as_object().ok_or_else(|| {
            StageError::MalformedInput("prompt output is not a JSON object".to_string())
        })?;
        let source = match object.get("prompts") {
            Some(Value::Object(nested)) => nested,
            _ => object,
        };

        // A null prompt is the same as a missing one.
        let field = |key: &str| source.get(key).filter(|v| !v.is_null()).cloned();

        Ok(Self {
            zero_shot: field("zeroShot"),
            tag_based: field("tagBased"),
            reasoning: field("reasoning"),
            custom: field("custom"),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.zero_shot.is_none()
            && self.tag_based.is_none()
            && self.reasoning.is_none()
            && self.custom.is_none()
    }
}

fn array_field(
    source: &serde_json::Map<String, Value>,
    key: &str,
    stage: Stage,
) -> Result<Vec<Value>, StageError> {
    match source.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(StageError::MalformedInput(format!(
            "{} output field '{}' must be an array, got {}",
            stage, key, other
        ))),
    }
}

/// A fully assembled invocation payload for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "payload", rename_all = "snake_case")]
pub enum StageInput {
    Chunker(ChunkerInput),
    GraphDb(GraphDbInput),
    VectorDb(VectorDbInput),
    Prompt(PromptInput),
    Llm(LlmInput),
}

impl StageInput {
    pub fn stage(&self) -> Stage {
        match self {
            StageInput::Chunker(_) => Stage::Chunker,
            StageInput::GraphDb(_) => Stage::GraphDb,
            StageInput::VectorDb(_) => Stage::VectorDb,
            StageInput::Prompt(_) => Stage::Prompt,
            StageInput::Llm(_) => Stage::Llm,
        }
    }

    /// Assembles the input for `stage` from the request and the outputs of
    /// its completed dependencies.
    pub fn build(
        stage: Stage,
        request: &PipelineRequest,
        upstream: &BTreeMap<Stage, Value>,
    ) -> Result<Self, StageError> {
        let context = RequestContext {
            id: request.id.clone(),
            domain: request.domain.clone(),
        };

        let input = match stage {
            Stage::Chunker => StageInput::Chunker(ChunkerInput {
                context,
                docs_source: request.docs_source.clone(),
                text_data: request.text_data.clone(),
                chunking_method: request.chunking_method.clone(),
            }),
            Stage::GraphDb => {
                let docs_source = Some(request.docs_source.clone()).filter(|s| !s.is_empty());
                if docs_source.is_none() && request.text_data.is_none() {
                    return Err(StageError::MalformedInput(
                        "graph_db requires docsSource or textData".to_string(),
                    ));
                }
                StageInput::GraphDb(GraphDbInput {
                    context,
                    docs_source,
                    text_data: request.text_data.clone(),
                    queries: request.queries.clone(),
                })
            }
            Stage::VectorDb => StageInput::VectorDb(VectorDbInput {
                context,
                docs_source: request.docs_source.clone(),
                text_data: request.text_data.clone(),
                embedding: request.embedding.clone(),
                vector_db: request.vector_db.clone(),
            }),
            Stage::Prompt => StageInput::Prompt(PromptInput {
                context,
                queries: request.queries.clone(),
                rag_text: request.rag_text.clone(),
                kg: KnowledgeGraph::from_output(upstream_output(upstream, Stage::GraphDb)?)?,
            }),
            Stage::Llm => StageInput::Llm(LlmInput {
                context,
                queries: request.queries.clone(),
                llm: request.llm.clone(),
                prompts: PromptSet::from_output(upstream_output(upstream, Stage::Prompt)?)?,
            }),
        };

        Ok(input)
    }

    /// The flat JSON object handed to the worker.
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            StageInput::Chunker(input) => serde_json::to_value(input),
            StageInput::GraphDb(input) => serde_json::to_value(input),
            StageInput::VectorDb(input) => serde_json::to_value(input),
            StageInput::Prompt(input) => serde_json::to_value(input),
            StageInput::Llm(input) => serde_json::to_value(input),
        }
    }

    /// Parses a flat worker payload back into the stage's schema.
    pub fn from_payload(stage: Stage, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match stage {
            Stage::Chunker => StageInput::Chunker(serde_json::from_value(payload)?),
            Stage::GraphDb => StageInput::GraphDb(serde_json::from_value(payload)?),
            Stage::VectorDb => StageInput::VectorDb(serde_json::from_value(payload)?),
            Stage::Prompt => StageInput::Prompt(serde_json::from_value(payload)?),
            Stage::Llm => StageInput::Llm(serde_json::from_value(payload)?),
        })
    }
}

fn upstream_output(upstream: &BTreeMap<Stage, Value>, stage: Stage) -> Result<&Value, StageError> {
    upstream.get(&stage).ok_or_else(|| {
        StageError::MalformedInput(format!("missing output of upstream stage '{}'", stage))
    })
}

/// Interprets raw worker stdout as a result payload.
///
/// Whole-output JSON wins; otherwise the last line that parses as a JSON
/// object is used (workers log before printing their result); otherwise the
/// trimmed text is kept as a JSON string.
pub fn parse_worker_output(raw: &str) -> Result<Value, StageError> {
    let trimmed = raw.trim();

    let value = serde_json::from_str::<Value>(trimmed).ok().or_else(|| {
        trimmed.lines().rev().find_map(|line| {
            match serde_json::from_str::<Value>(line.trim()) {
                Ok(value @ Value::Object(_)) => Some(value),
                _ => None,
            }
        })
    });

    check_result(value.unwrap_or_else(|| Value::String(trimmed.to_string())))
}

/// Rejects results that carry the `error` key.
pub fn check_result(value: Value) -> Result<Value, StageError> {
    if let Some(error) = value.as_object().and_then(|object| object.get("error")) {
        let message = match error {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        };
        return Err(StageError::MalformedInput(message));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> PipelineRequest {
        PipelineRequest::new("req-1", "legal", "s3://docs/contracts")
            .with_queries(vec!["who signs?".to_string()])
    }

    #[test]
    fn test_chunker_payload_is_flat_camel_case() {
        let mut req = request();
        req.chunking_method = Some("semantic".to_string());
        let input = StageInput::build(Stage::Chunker, &req, &BTreeMap::new()).unwrap();

        let payload = input.to_payload().unwrap();
        assert_eq!(
            payload,
            json!({
                "id": "req-1",
                "domain": "legal",
                "docsSource": "s3://docs/contracts",
                "chunkingMethod": "semantic"
            })
        );
    }

    #[test]
    fn test_payloads_survive_serialization() {
        let mut upstream = BTreeMap::new();
        upstream.insert(
            Stage::GraphDb,
            json!({"kgTriples": ["a-rel-b", {"s": "a", "p": "rel", "o": "b"}], "ner": ["ACME"]}),
        );
        upstream.insert(
            Stage::Prompt,
            json!({"prompts": {
                "zeroShot": "Answer.",
                "tagBased": null,
                "reasoning": ["step 1", "step 2"]
            }}),
        );
        let mut req = request();
        req.vector_db = Some("qdrant".to_string());
        req.rag_text = Some("context".to_string());
        req.llm = Some("mistral".to_string());

        for stage in Stage::ALL {
            let input = StageInput::build(stage, &req, &upstream).unwrap();
            assert_eq!(input.stage(), stage);

            let flat = input.to_payload().unwrap();
            assert_eq!(StageInput::from_payload(stage, flat).unwrap(), input);

            let tagged = serde_json::to_string(&input).unwrap();
            assert_eq!(serde_json::from_str::<StageInput>(&tagged).unwrap(), input);
        }
    }

    #[test]
    fn test_null_prompts_are_absent() {
        let prompts =
            PromptSet::from_output(&json!({"prompts": {"zeroShot": null, "custom": "c"}})).unwrap();
        assert_eq!(prompts.zero_shot, None);
        assert_eq!(prompts.custom, Some(json!("c")));

        let round_trip: PromptSet =
            serde_json::from_value(serde_json::to_value(&prompts).unwrap()).unwrap();
        assert_eq!(round_trip, prompts);
    }

    #[test]
    fn test_vector_db_key_spelling() {
        let mut req = request();
        req.vector_db = Some("chroma".to_string());
        let payload = StageInput::build(Stage::VectorDb, &req, &BTreeMap::new())
            .unwrap()
            .to_payload()
            .unwrap();
        assert_eq!(payload["vectorDB"], json!("chroma"));
    }

    #[test]
    fn test_kg_forwarded_from_top_level_or_nested() {
        let top = json!({"kgTriples": ["a-rel-b"], "ner": []});
        let nested = json!({"kg": {"kgTriples": ["a-rel-b"], "ner": []}, "cypher": "MATCH"});

        for output in [top, nested] {
            let kg = KnowledgeGraph::from_output(&output).unwrap();
            assert_eq!(kg.kg_triples, vec![json!("a-rel-b")]);
            assert!(kg.ner.is_empty());
        }
    }

    #[test]
    fn test_kg_rejects_non_object_output() {
        let err = KnowledgeGraph::from_output(&json!("Graph created")).unwrap_err();
        assert!(matches!(err, StageError::MalformedInput(_)));

        let err = KnowledgeGraph::from_output(&json!({"kgTriples": "a-rel-b"})).unwrap_err();
        assert!(err.to_string().contains("kgTriples"));
    }

    #[test]
    fn test_prompts_forwarded() {
        let nested = PromptSet::from_output(&json!({"prompts": {"zeroShot": "z", "custom": "c"}}))
            .unwrap();
        assert_eq!(nested.zero_shot, Some(json!("z")));
        assert_eq!(nested.custom, Some(json!("c")));
        assert!(nested.tag_based.is_none());

        let top = PromptSet::from_output(&json!({"tagBased": "<t>"})).unwrap();
        assert_eq!(top.tag_based, Some(json!("<t>")));
        assert!(PromptSet::from_output(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_graph_db_needs_a_source() {
        let mut req = request();
        req.docs_source.clear();
        let err = StageInput::build(Stage::GraphDb, &req, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StageError::MalformedInput(_)));

        let req = req.with_text_data("raw text");
        assert!(StageInput::build(Stage::GraphDb, &req, &BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_missing_upstream_is_malformed() {
        let err = StageInput::build(Stage::Llm, &request(), &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn test_parse_worker_output() {
        assert_eq!(
            parse_worker_output("{\"chunks\": [\"a\"]}\n").unwrap(),
            json!({"chunks": ["a"]})
        );

        let logs = "INFO loading model\nINFO done\n{\"answer\": 42}\n";
        assert_eq!(parse_worker_output(logs).unwrap(), json!({"answer": 42}));

        assert_eq!(
            parse_worker_output("LLM generated response").unwrap(),
            json!("LLM generated response")
        );
    }

    #[test]
    fn test_error_key_is_failure() {
        let err = parse_worker_output("{\"error\": \"docsSource unreadable\"}").unwrap_err();
        assert_eq!(err, StageError::MalformedInput("docsSource unreadable".to_string()));
        assert!(!err.is_retryable());

        let err = check_result(json!({"error": {"code": 3}})).unwrap_err();
        assert!(err.to_string().contains("code"));
    }
}
