use crate::ImageCounts;

/// Longest description, in characters, embedded in a prompt.
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

pub const SYSTEM_PROMPT: &str = "\
Eres un experto en redacción profesional para empresas de construcción y renovación.
Tu tarea es transformar descripciones informales de trabajos de renovación en textos profesionales y atractivos para clientes.

Directrices:
- Mantén un tono profesional pero cercano
- Destaca las mejoras y transformaciones realizadas
- Organiza la información con viñetas cuando sea apropiado
- Enfócate en los beneficios para el cliente
- Usa un español claro y profesional
- Incluye detalles técnicos solo si son relevantes
- Crea una descripción de 2-4 párrafos máximo
- Empieza con una frase impactante sobre la transformación";

pub fn user_prompt(title: &str, original: &str, images: ImageCounts) -> String {
    format!(
        "Proyecto: \"{title}\"\n\
        \n\
        Descripción informal del trabajador:\n\
        \"{description}\"\n\
        \n\
        Información adicional:\n\
        - {before} fotos del estado original\n\
        - {after} fotos del resultado final\n\
        \n\
        Por favor, transforma esta descripción en un texto profesional y atractivo para presentar al cliente.",
        description = truncate_chars(original, MAX_DESCRIPTION_CHARS),
        before = images.before,
        after = images.after,
    )
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
