use tabled::Tabled;

use crate::domain::Credential;

pub fn mask(plaintext: &str) -> String {
    let len = plaintext.chars().count();
    let head = plaintext.chars().take(2).collect::<String>();
    let tail = plaintext.chars().rev().take(2).collect::<String>();

    match len {
        0 => "(empty)".into(),
        1..=5 => "***".into(),
        _ => format!("{}***{}", head, tail.chars().rev().collect::<String>()),
    }
}

/// `#RRGGBB` (opaque) or `AARRGGBB`.
pub fn parse_color(input: &str) -> Option<u32> {
    let hex = input.trim();
    match hex.strip_prefix('#') {
        Some(rgb) if rgb.len() == 6 => u32::from_str_radix(rgb, 16).ok().map(|c| 0xFF00_0000 | c),
        Some(argb) if argb.len() == 8 => u32::from_str_radix(argb, 16).ok(),
        Some(_) => None,
        None if hex.len() == 8 => u32::from_str_radix(hex, 16).ok(),
        None => None,
    }
}

pub fn format_color(argb: u32) -> String {
    format!("#{argb:08X}")
}

#[derive(Tabled)]
pub struct CredentialRow {
    pub id: u32,
    pub name: String,
    pub labels: String,
    pub fields: usize,
    pub images: usize,
    pub updated_at: String,
}

impl From<&Credential> for CredentialRow {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            labels: c.sorted_labels().join(", "),
            fields: c.fields.len(),
            images: c.image_paths.len(),
            updated_at: c.updated_at.to_rfc3339(),
        }
    }
}
