use crate::llm::truncate_chars;
use crate::ontology::Ontology;
use crate::tools::Tool;

use super::trace::AgentTurn;

const TIE_BREAKS: &str = "\
Choosing between tools:
- A concrete entity is named (an id, a name, an exact value): prefer get_node_details or filter_nodes over cypher_query.
- Similarity or meaning (\"like\", \"related to\", \"about\"): prefer vector_search.
- Counting a whole label or describing the graph: prefer graph_stats.
- Relationships, paths and grouped counts: use cypher_query.
- Do not repeat a call you already made; its result will not change.";

const DECISION_FORMAT: &str = r#"Reply with exactly one JSON object and nothing else:
{"action": "call_tool", "tool": "<tool name>", "arguments": {...}, "rationale": "<why this tool>"}
or, once the observations answer the question:
{"action": "finish", "rationale": "<why the observations are sufficient>"}"#;

/// System prompt for planning: schema summary, tool catalogue, guidance.
pub fn planning_system(tools: &[Tool], ontology: &Ontology, max_iterations: usize) -> String {
    let mut prompt = String::from(
        "You answer questions about a knowledge graph built from a relational database. \
         You work in steps: each step either calls one read-only tool or finishes.\n\n",
    );

    prompt.push_str("Graph schema:\n");
    for node in &ontology.nodes {
        let properties: Vec<&str> = node.attributes.iter().map(|a| a.property.as_str()).collect();
        prompt.push_str(&format!("- (:{}) properties: {}\n", node.label, properties.join(", ")));
    }
    for rel in &ontology.relationships {
        prompt.push_str(&format!("- (:{})-[:{}]->(:{})\n", rel.from_label, rel.rel_type, rel.to_label));
    }

    prompt.push_str("\nTools:\n");
    for tool in tools {
        prompt.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, tool.input_schema
        ));
    }

    prompt.push('\n');
    prompt.push_str(TIE_BREAKS);
    prompt.push_str(&format!("\n\nYou have at most {} steps.\n\n", max_iterations));
    prompt.push_str(DECISION_FORMAT);
    prompt
}

fn render_turn(step: usize, turn: &AgentTurn) -> String {
    format!(
        "Step {}: {} {}\nRationale: {}\nObservation: {}\n\n",
        step, turn.tool, turn.arguments, turn.rationale, turn.observation
    )
}

fn omitted_note(turns: &[AgentTurn]) -> String {
    let tools: Vec<&str> = turns.iter().map(|t| t.tool.as_str()).collect();
    format!(
        "Steps 1-{} omitted to fit the prompt (tools called: {}).\n\n",
        turns.len(),
        tools.join(", ")
    )
}

/// Render the turns into at most `budget` characters. The oldest turns go
/// first; the latest turn is always kept, cut if it alone is too long.
fn render_turns(turns: &[AgentTurn], budget: usize, out: &mut String) {
    let Some(last) = turns.len().checked_sub(1) else {
        out.push_str("No tools called yet.\n");
        return;
    };

    let rendered: Vec<String> = turns.iter().enumerate().map(|(i, t)| render_turn(i + 1, t)).collect();
    let lengths: Vec<usize> = rendered.iter().map(|r| r.chars().count()).collect();
    if lengths.iter().sum::<usize>() <= budget {
        rendered.iter().for_each(|r| out.push_str(r));
        return;
    }

    let reserve = omitted_note(&turns[..last]).chars().count();
    let mut older = 0;
    let mut first_kept = last;
    while first_kept > 0 && reserve + older + lengths[first_kept - 1] + lengths[last] <= budget {
        first_kept -= 1;
        older += lengths[first_kept];
    }

    if first_kept > 0 {
        out.push_str(&omitted_note(&turns[..first_kept]));
    }
    for text in &rendered[first_kept..last] {
        out.push_str(text);
    }
    let latest = truncate_chars(&rendered[last], budget.saturating_sub(reserve + older + 2));
    out.push_str(latest);
    if latest.len() < rendered[last].len() {
        out.push_str("\n\n");
    }
}

/// Planning prompt for the next step. `feedback` carries the problem with
/// the previous decision when re-planning. The question and the closing
/// instruction always fit in `max_chars`; older turns give way first.
pub fn planning_prompt(query: &str, turns: &[AgentTurn], feedback: Option<&str>, max_chars: usize) -> String {
    let head = format!("Question: {}\n\n", query);
    let tail = match feedback {
        Some(feedback) => format!(
            "Your previous reply could not be used: {}\nReply again with one valid JSON decision.\n",
            feedback
        ),
        None => "Decide the next step.\n".to_string(),
    };

    let mut prompt = head.clone();
    let budget = max_chars.saturating_sub(head.chars().count() + tail.chars().count());
    render_turns(turns, budget, &mut prompt);
    prompt.push_str(&tail);
    prompt
}

pub const FINALIZE_SYSTEM: &str = "You answer questions about a knowledge graph. Use only the tool \
observations provided. Quote exact numbers and names from them. If they do not answer the question, \
say what is missing. Reply in plain text.";

pub fn finalize_prompt(query: &str, turns: &[AgentTurn], max_chars: usize) -> String {
    const TAIL: &str = "Write the answer.";
    let mut prompt = format!("Question: {}\n\nObservations:\n", query);
    let budget = max_chars.saturating_sub(prompt.chars().count() + TAIL.len());
    render_turns(turns, budget, &mut prompt);
    prompt.push_str(TAIL);
    prompt
}
