use crate::generation::chain::ChainContext;
use crate::generation::orchestrator::ErrorHistory;

const RETRY_RULES: [&str; 6] = [
    "Contains only a SINGLE SQL statement (no semicolons except in string literals)",
    "Is a valid JSON object with 'query' and 'summary' fields",
    "Has proper spacing in the SQL query (no extra spaces or line breaks)",
    "Uses simple single quotes for SQL strings (not escaped)",
    "Contains no additional text or formatting outside the JSON object",
    "For DELETE operations with constraints, use proper JOIN and WHERE clauses instead of multiple statements",
];

pub fn generation_prompt(
    request: &str,
    schema: &str,
    chain: Option<&ChainContext>,
    history: &ErrorHistory,
    attempt: u32,
) -> String {
    let chain_context = chain.map(chain_section).unwrap_or_default();
    let error_context = error_section(history);

    format!(
        r#"Given the following database schema:
{schema}
{chain_context}
Generate a SINGLE SQL query for the following request:
{request}

This is attempt {attempt} to generate the correct query.{error_context}

IMPORTANT:
- Return ONLY ONE SQL statement (no semicolons except in string literals)
- For operations requiring multiple steps (like cascading deletes), use proper JOIN and WHERE clauses
- Return a properly formatted JSON object with consistent spacing and no line breaks in the SQL query

Here are two examples of expected outputs:

Example 1 - For the request "Delete all orders and their related items":
{{
    "query": "DELETE FROM orders WHERE order_id IN (SELECT o.order_id FROM orders o JOIN order_items oi ON o.order_id = oi.order_id)",
    "summary": "Deletes orders and their related items using a subquery"
}}

Example 2 - For the request "Update product prices and related order items":
{{
    "query": "UPDATE products p SET price = p.price * 1.1 WHERE product_id IN (SELECT DISTINCT product_id FROM order_items WHERE order_date >= CURRENT_DATE - INTERVAL '30 days')",
    "summary": "Updates product prices with a 10% increase for products ordered in the last 30 days"
}}

Return only a JSON object with two fields:
1. 'query': the SQL query (single statement, proper spacing, no line breaks)
2. 'summary': a brief explanation of what the query does"#
    )
}

fn error_section(history: &ErrorHistory) -> String {
    if history.is_empty() {
        return String::new();
    }

    let mut section = format!(
        "\n\nPrevious errors encountered:\n- {}\n\nPlease ensure your response:",
        history.entries().join("\n- ")
    );
    for (idx, rule) in RETRY_RULES.iter().enumerate() {
        section.push_str(&format!("\n{}. {}", idx + 1, rule));
    }
    section
}

fn chain_section(context: &ChainContext) -> String {
    // Serializing a Vec of JSON maps cannot fail
    let results = serde_json::to_string_pretty(&context.previous_results)
        .unwrap_or_else(|_| "[]".to_string());

    let queries = if context.previous_queries.is_empty() {
        "(none)".to_string()
    } else {
        context
            .previous_queries
            .iter()
            .enumerate()
            .map(|(idx, q)| format!("{}. {}", idx + 1, q))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"
This request is one step of a multi-step task. Build on the work already done.

Previous step results:
{results}

Queries already executed, in order:
{queries}
"#
    )
}

pub fn classification_prompt(request: &str) -> String {
    format!(
        r#"Analyze this database query request:
{request}

Determine if this requires a single SQL query or multiple chained queries. Consider:
- Multiple distinct operations needed
- Step-by-step data transformations
- Temporary results needed for final output

Respond with JSON format only, no other text:
{{
    "query_type": "single" | "multi",
    "steps": ["step 1 description", "step 2 description"]
}}
Include "steps" only when query_type is "multi"."#
    )
}
