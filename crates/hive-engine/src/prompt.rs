//! System-prompt assembly: general prompt + current phase + action status
//! lines + armed upsell prompts.

use hive_store::types::{ActionState, Phase};

/// Status line block appended for actions with `track_usage`, so the model
/// knows which actions it already fired for this user.
pub fn action_status_lines(statuses: &[(String, ActionState)]) -> String {
    if statuses.is_empty() {
        return String::new();
    }
    let mut out = String::from("Status das ações:\n");
    for (name, state) in statuses {
        let label = match state {
            ActionState::Inactive => "INACTIVE",
            ActionState::Activated => "ACTIVATED",
        };
        out.push_str(&format!("- {name}: {label}\n"));
    }
    out
}

/// Assemble the full system prompt for one LLM round.
pub fn assemble_system(
    general: Option<&Phase>,
    current: Option<&Phase>,
    statuses: &[(String, ActionState)],
    armed_upsell_prompts: &[String],
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(g) = general {
        if !g.prompt_text.is_empty() {
            parts.push(g.prompt_text.clone());
        }
    }
    match current {
        // The general phase is already included; avoid doubling it.
        Some(p) if !general.is_some_and(|g| g.id == p.id) && !p.prompt_text.is_empty() => {
            parts.push(p.prompt_text.clone());
        }
        _ => {}
    }
    let status_block = action_status_lines(statuses);
    if !status_block.is_empty() {
        parts.push(status_block);
    }
    for prompt in armed_upsell_prompts {
        if !prompt.is_empty() {
            parts.push(prompt.clone());
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(id: i64, prompt: &str, general: bool) -> Phase {
        Phase {
            id,
            bot_id: 1,
            name: if general { "general".into() } else { format!("p{id}") },
            prompt_text: prompt.into(),
            trigger_terms: vec![],
            ordering: id,
            is_general: general,
        }
    }

    #[test]
    fn general_plus_phase_plus_status() {
        let g = phase(1, "Você é um vendedor.", true);
        let p = phase(2, "Feche a venda agora.", false);
        let statuses = vec![("Enviar bônus".to_string(), ActionState::Inactive)];
        let system = assemble_system(Some(&g), Some(&p), &statuses, &[]);
        assert!(system.starts_with("Você é um vendedor."));
        assert!(system.contains("Feche a venda agora."));
        assert!(system.contains("- Enviar bônus: INACTIVE"));
    }

    #[test]
    fn general_as_current_is_not_doubled() {
        let g = phase(1, "Você é um vendedor.", true);
        let system = assemble_system(Some(&g), Some(&g), &[], &[]);
        assert_eq!(system.matches("Você é um vendedor.").count(), 1);
    }

    #[test]
    fn armed_upsell_prompt_is_included() {
        let g = phase(1, "Base.", true);
        let system = assemble_system(Some(&g), None, &[], &["Ofereça o plano anual.".into()]);
        assert!(system.contains("Ofereça o plano anual."));
    }
}
