use crate::GenerationRequest;

/// Appends the pottery modifiers to `base`, each after a comma, in style → material →
/// perspective order. Missing or blank modifiers are skipped.
pub fn compose_prompt(
    base: &str,
    style: Option<&str>,
    material: Option<&str>,
    perspective: Option<&str>,
) -> String {
    let mut prompt = base.to_string();
    if let Some(style) = present(style) {
        prompt.push_str(", ");
        prompt.push_str(style);
        prompt.push_str(" style");
    }
    for modifier in [material, perspective].into_iter().filter_map(present) {
        prompt.push_str(", ");
        prompt.push_str(modifier);
    }
    prompt
}

pub fn compose_request_prompt(request: &GenerationRequest) -> String {
    compose_prompt(
        request.prompt(),
        request.style(),
        request.material(),
        request.perspective(),
    )
}

fn present(modifier: Option<&str>) -> Option<&str> {
    modifier.map(str::trim).filter(|m| !m.is_empty())
}
