//! Response style blocks attached with the #style operator

use serde::{Deserialize, Serialize};

/// A named style block injected when style-guidance injection fires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub id: String,
    pub name: String,
    pub guidance: String,
}

impl Style {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("style id must be non-empty".to_string());
        }
        if self.guidance.trim().is_empty() {
            return Err(format!("style '{}' has no guidance body", self.id));
        }
        Ok(())
    }
}

/// Built-in styles seeded alongside file-loaded ones
pub fn builtin_styles() -> Vec<Style> {
    vec![
        Style {
            id: "analytical".to_string(),
            name: "Analytical".to_string(),
            guidance: "Structure the response around explicit claims and the \
evidence for each. Prefer numbered findings over narrative."
                .to_string(),
        },
        Style {
            id: "concise".to_string(),
            name: "Concise".to_string(),
            guidance: "Answer in the fewest sentences that remain complete. \
No preamble, no recap."
                .to_string(),
        },
        Style {
            id: "exploratory".to_string(),
            name: "Exploratory".to_string(),
            guidance: "Surface several distinct directions before committing. \
Label speculation as such."
                .to_string(),
        },
    ]
}
