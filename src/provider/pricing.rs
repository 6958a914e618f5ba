// src/provider/pricing.rs — Per-model price table for advisory cost estimates

/// Fallback rate for model ids missing from the table, in USD per million tokens.
pub const DEFAULT_PRICING: (f64, f64) = (1.0, 3.0);

/// Returns (input_price_per_mtok, output_price_per_mtok).
pub fn model_pricing(model: &str) -> (f64, f64) {
    match model {
        // Anthropic
        m if m.contains("claude-opus") => (15.0, 75.0),
        m if m.contains("claude-sonnet") => (3.0, 15.0),
        m if m.contains("claude-haiku") || m.contains("haiku") => (0.8, 4.0),

        // OpenAI
        m if m.contains("gpt-4.1-mini") => (0.4, 1.6),
        m if m.contains("gpt-4.1-nano") => (0.1, 0.4),
        m if m.contains("gpt-4.1") => (2.0, 8.0),
        m if m.contains("gpt-4o-mini") => (0.15, 0.6),
        m if m.contains("gpt-4o") => (2.5, 10.0),
        m if m.contains("o3-mini") || m.contains("o4-mini") => (1.1, 4.4),
        m if m.contains("o3") => (10.0, 40.0),

        // Google Gemini (served through OpenAI-compatible endpoints)
        m if m.contains("gemini-2.5-pro") => (1.25, 10.0),
        m if m.contains("gemini-2.5-flash") => (0.15, 0.6),
        m if m.contains("gemini-2.0-flash") => (0.1, 0.4),

        // Local models (free)
        m if m.contains("llama")
            || m.contains("mistral")
            || m.contains("gemma")
            || m.contains("qwen")
            || m.contains("deepseek") =>
        {
            (0.0, 0.0)
        }

        _ => DEFAULT_PRICING,
    }
}

/// Estimated USD cost for a single call.
pub fn estimate_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    let (input_price, output_price) = model_pricing(model);
    (prompt_tokens as f64 / 1_000_000.0) * input_price
        + (completion_tokens as f64 / 1_000_000.0) * output_price
}
