//! System prompts and user-prompt payload builders for each LLM-backed node.
//!
//! Every builder serialises a single JSON object as the user prompt; the
//! system prompts are fixed strings instructing the model to return exactly
//! one JSON object matching the node's output contract.

use serde_json::{json, Value};

use crate::graph::state::{HiddenContextResult, TaskParseResult};
use crate::schema_kb::{AliasPair, SchemaHintTable};

pub const INTENT_SYSTEM_PROMPT: &str = r#"你是教务查询助手的意图识别模块。
给定用户当前问题和最近的历史提问，判断本次问题属于闲聊（chat）还是教务业务查询（business_query），并在需要时把追问补全为独立的问题。

只返回一个 JSON 对象，不要输出任何解释、前后缀或 markdown 代码块。
JSON 字段：
- intent: "chat" 或 "business_query"
- is_followup: 布尔值，表示本次问题是否依赖历史上下文
- confidence: 0 到 1 之间的数字
- merged_query: 补全历史上下文后的独立问题（若不是追问，等同于原问题的清晰表述）
- rewritten_query: 用于后续检索/生成的改写问题，通常与 merged_query 相同

除上述字段外不要添加任何字段。"#;

pub fn build_intent_user_prompt(message: &str, history_user_messages: &[String]) -> String {
    let history: Vec<&String> = history_user_messages.iter().rev().take(4).rev().collect();
    let payload = json!({
        "message": message,
        "history_user_messages": history,
        "output_schema": {
            "intent": "chat|business_query",
            "is_followup": "boolean",
            "confidence": "0~1",
            "merged_query": "string",
            "rewritten_query": "string",
        },
    });
    payload.to_string()
}

pub const TASK_PARSE_SYSTEM_PROMPT: &str = r#"你是教务查询助手的任务解析模块。
把用户的业务查询问题解析成结构化的查询任务，供后续 SQL 生成使用。

只返回一个 JSON 对象，不要输出 markdown 或解释文字。
JSON 字段：
- intent: 固定为 "business_query"
- entities: [{type, value}]
- dimensions: [string]，维度字段，须为 table.field 形式
- metrics: [string]，指标字段或指标描述
- filters: [{field, op, value}]，field 必须是 table.field 形式且来自给定的字段白名单
- time_range: {start, end}，日期使用 YYYY-MM-DD 或 null
- operation: "detail" | "aggregate" | "ranking" | "trend"
- confidence: 0 到 1 之间的数字

op 只能是 {=, !=, <, >, <=, >=, like, in, not in, between} 之一。"#;

pub fn build_task_parse_user_prompt(query: &str, field_whitelist: &[String], alias_pairs: &[AliasPair]) -> String {
    let payload = json!({
        "query": query,
        "kb_field_whitelist": field_whitelist,
        "alias_hints": alias_pairs.iter().map(|p| json!({p.field.clone(): p.aliases})).collect::<Vec<_>>(),
        "output_schema": {
            "intent": "business_query",
            "entities": [{"type": "string", "value": "string"}],
            "dimensions": ["table.field"],
            "metrics": ["string"],
            "filters": [{"field": "table.field", "op": "=", "value": "string|number|boolean"}],
            "time_range": {"start": "YYYY-MM-DD|null", "end": "YYYY-MM-DD|null"},
            "operation": "detail|aggregate|ranking|trend",
            "confidence": "0~1",
        },
    });
    payload.to_string()
}

pub const SQL_GENERATION_SYSTEM_PROMPT: &str = r#"你是教务查询助手的 SQL 生成模块。
基于任务解析结果生成只读的 PostgreSQL SQL。严格遵守：
1) 只输出一个 JSON 对象，不要输出 markdown、解释或多余文本。
2) JSON 必须包含：
   - sql: string
   - entity_mappings: [{type, value, field, reason}]
   - sql_fields: [table.field]
3) sql 必须以 WITH（CTE 形式）开头。
4) 在 CTE 之外引用字段必须写成 table.field；在 CTE 内部声明的字段可写成 cte_name.field，前提是该列确实是这个 CTE SELECT 出来的列。
5) 所有非 CTE 的 table.field 引用必须来自 kb_field_whitelist。
6) entity_mappings 必须覆盖每一个输入实体，并映射到出现在 sql_fields 中的具体字段；reason 说明原始值到过滤值的映射依据，如果依据来自 hidden_context.probe_samples 要明确提及。
7) 当 hidden_context.probe_samples 存在时，优先把过滤值归一化为探测到的候选值：精确匹配优先于归一化匹配，再优先于语义近似匹配，最后才用 LIKE 配合额外限定条件收窄。
8) 当 operation 为 detail 或 ranking 且结果按学生分组时，必须保证每个学生只出现一行（使用 GROUP BY 或 EXISTS），禁止依赖跨列的 SELECT DISTINCT 去重。

不要编造 kb_field_whitelist 之外的字段。"#;

pub fn build_sql_generation_user_prompt(
    rewritten_query: &str,
    task: &TaskParseResult,
    field_whitelist: &[String],
    alias_pairs: &[AliasPair],
    schema_hints: &[SchemaHintTable],
    hidden_context: Option<&HiddenContextResult>,
) -> String {
    let payload = json!({
        "rewritten_query": rewritten_query,
        "task": task,
        "kb_field_whitelist": field_whitelist,
        "alias_hints": alias_pairs.iter().map(|p| json!({p.field.clone(): p.aliases})).collect::<Vec<_>>(),
        "kb_schema_hints": schema_hints,
        "hidden_context": hidden_context,
        "output_schema": {
            "sql": "WITH ... SELECT ...",
            "entity_mappings": [{"type": "string", "value": "string", "field": "table.field", "reason": "string"}],
            "sql_fields": ["table.field"],
        },
    });
    payload.to_string()
}

pub const RESULT_SUMMARY_SYSTEM_PROMPT: &str = r#"你是教务查询助手的结果总结模块。
基于用户问题与查询结果，生成简洁、准确、可直接展示给用户的总结。

只返回一个 JSON 对象，不要输出 markdown、解释或多余文本。
JSON 必须包含字段：
- summary: string，使用中文，不超过120字

若 final_status=success，summary 要直接回答问题。
若 final_status=partial_success 或 failed，summary 要说明当前结果与 reason_code 的含义，并给出简短建议。
不要虚构不存在的数据，只基于输入结果描述。
若输入包含 field_display_hints，引用字段时优先使用其中的中文展示名，不要直接输出 table.field 或字段的英文名。"#;

pub fn build_result_summary_user_prompt(
    user_query: &str,
    rewritten_query: &str,
    final_status: &str,
    reason_code: Option<&str>,
    task: Option<&TaskParseResult>,
    sql_validate_result: Option<&Value>,
    hidden_context_retry_count: u32,
    field_display_hints: &serde_json::Map<String, Value>,
) -> String {
    let payload = json!({
        "user_query": user_query,
        "rewritten_query": rewritten_query,
        "final_status": final_status,
        "reason_code": reason_code,
        "task": task,
        "sql_validate_result": sql_validate_result,
        "hidden_context_retry_count": hidden_context_retry_count,
        "field_display_hints": field_display_hints,
        "output_schema": {
            "summary": "string",
        },
    });
    payload.to_string()
}
