//! Derives an instanced-sprite shader from a caller's WGSL surface shader.
//!
//! The patch is textual and line based. Every hook that cannot be located leaves that part
//! of the shader untouched and is reported at debug level, so unsupported shaders still
//! compile and render without sprite UVs.

use crate::config::SpriteGeometryKind;
use bitflags::bitflags;

const SPRITE_SUPPORT_WGSL: &str = include_str!("../assets/shaders/sprite_patch.wgsl");
/// Base surface shader shipped with the crate.
pub const SPRITE_UNLIT_WGSL: &str = include_str!("../assets/shaders/sprite_unlit.wgsl");

/// Name of the flat field added to the vertex output struct.
pub const INSTANCE_FIELD: &str = "sprite_instance";
const INSTANCE_PARAM: &str = "sprite_instance_index";
const SPRITE_UV: &str = "sprite_uv";
const SPRITE_LOCAL_UV: &str = "sprite_local_uv";

bitflags! {
    /// Per-instance flags; mirrored by the `SPRITE_*` constants in `sprite_patch.wgsl`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SpriteFlags: u32 {
        const FLIP_X = 1;
        const FLIP_Y = 1 << 1;
        const BILLBOARD = 1 << 2;
        const TINT = 1 << 3;
    }
}

/// Hue/saturation/value adjustment applied after the atlas sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TintHsv {
    /// Hue rotation in thirds of a turn, `0..3`.
    pub hue: f32,
    pub saturation: f32,
    pub value: f32,
}

impl Default for TintHsv {
    fn default() -> Self {
        Self { hue: 0.0, saturation: 1.0, value: 1.0 }
    }
}

impl TintHsv {
    pub fn new(hue: f32, saturation: f32, value: f32) -> Self {
        Self { hue, saturation, value }
    }

    /// Uniform layout `(hue, saturation, value, enabled)`.
    pub fn to_uniform(tint: Option<TintHsv>) -> [f32; 4] {
        match tint {
            Some(t) => [t.hue, t.saturation, t.value, 1.0],
            None => [0.0; 4],
        }
    }

    /// CPU version of `sprite_hsv_tint`.
    pub fn apply(&self, rgb: [f32; 3]) -> [f32; 3] {
        let hue = [self.hue, self.hue, self.hue];
        let centers = [0.0, 2.0, 1.0];
        let mut term = [0.0_f32; 3];
        for i in 0..3 {
            term[i] = 1.0 - (hue[i] - centers[i]).abs().min(1.0);
        }
        term[0] = 1.0 - (term[1] + term[2]);
        let dot = |a: [f32; 3], b: [f32; 3]| a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
        let rotated = [
            dot(rgb, [term[0], term[1], term[2]]),
            dot(rgb, [term[2], term[0], term[1]]),
            dot(rgb, [term[1], term[2], term[0]]),
        ];
        let luma = dot(rotated, [0.2, 0.5, 0.3]);
        rotated.map(|c| (luma + (c - luma) * self.saturation) * self.value)
    }
}

/// Uniform block `SpriteGlobals`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SpriteGlobalsUniform {
    pub tint: [f32; 4],
    pub grid_side: u32,
    pub flip_x: u32,
    pub flip_y: u32,
    pub billboard: u32,
}

/// One element of the `sprite_params` storage array.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SpriteInstanceRecord {
    pub tint: [f32; 4],
    pub flags: u32,
    pub overrides: u32,
    pub _pad: [u32; 2],
}

/// Where the patcher hooks into a caller WGSL shader.
///
/// Matrix and position expressions must be valid WGSL at every `return` of the vertex
/// entry point. Defaults describe [`SPRITE_UNLIT_WGSL`].
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceShader {
    pub source: String,
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub vertex_output: String,
    pub clip_position: String,
    /// Name of the fragment entry parameter holding the vertex output.
    pub fragment_input: String,
    pub model_matrix: String,
    pub view_matrix: String,
    pub projection_matrix: String,
    pub local_position: String,
    /// UV expressions replaced by the sprite UV; the first one feeds the frame remap.
    pub uv_idents: Vec<String>,
}

impl SurfaceShader {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            vertex_entry: "vs_main".to_string(),
            fragment_entry: "fs_main".to_string(),
            vertex_output: "VertexOutput".to_string(),
            clip_position: "clip_position".to_string(),
            fragment_input: "in".to_string(),
            model_matrix: "model".to_string(),
            view_matrix: "camera.view".to_string(),
            projection_matrix: "camera.proj".to_string(),
            local_position: "input.position".to_string(),
            uv_idents: vec!["in.uv".to_string()],
        }
    }

    pub fn sprite_unlit() -> Self {
        Self::new(SPRITE_UNLIT_WGSL)
    }

    pub fn with_uv_idents<I, S>(mut self, idents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uv_idents = idents.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpriteShaderOptions {
    /// Bind group index used for the sprite resources.
    pub bind_group: u32,
    pub geometry: SpriteGeometryKind,
}

impl Default for SpriteShaderOptions {
    fn default() -> Self {
        Self { bind_group: 2, geometry: SpriteGeometryKind::Quad }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchedShader {
    pub source: String,
    pub replaced_uv_refs: usize,
    pub vertex_hooked: bool,
    pub tint_hooked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SpriteShaderPatcher {
    options: SpriteShaderOptions,
}

impl SpriteShaderPatcher {
    pub fn new(options: SpriteShaderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SpriteShaderOptions {
        &self.options
    }

    /// WGSL prepended to every patched shader.
    pub fn support_source(&self) -> String {
        let tri = matches!(self.options.geometry, SpriteGeometryKind::Tri);
        SPRITE_SUPPORT_WGSL
            .replace("{{group}}", &self.options.bind_group.to_string())
            .replace("{{tri_geometry}}", if tri { "true" } else { "false" })
    }

    pub fn patch(&self, surface: &SurfaceShader) -> PatchedShader {
        let mut lines: Vec<String> = surface.source.lines().map(str::to_string).collect();
        let mut vertex_hooked = false;
        let mut replaced_uv_refs = 0;
        let mut tint_hooked = false;

        if add_instance_field(&mut lines, &surface.vertex_output) {
            match ensure_instance_index(&mut lines, &surface.vertex_entry) {
                Some(instance) => vertex_hooked = hook_vertex_returns(&mut lines, surface, &instance) > 0,
                None => log::debug!(
                    "[shader] vertex entry '{}' not found, billboarding disabled",
                    surface.vertex_entry
                ),
            }
            if vertex_hooked {
                replaced_uv_refs = patch_fragment_uvs(&mut lines, surface);
                tint_hooked = hook_tint(&mut lines, surface);
            }
        } else {
            log::debug!("[shader] vertex output struct '{}' not found, shader left unpatched", surface.vertex_output);
        }
        if replaced_uv_refs == 0 {
            log::debug!("[shader] no UV references matched {:?}, sprite UVs inactive", surface.uv_idents);
        }

        let mut source = self.support_source();
        source.push_str(&lines.join("\n"));
        source.push('\n');
        PatchedShader { source, replaced_uv_refs, vertex_hooked, tint_hooked }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Replaces whole-token occurrences of `ident` (which may contain `.`).
fn replace_ident(line: &str, ident: &str, replacement: &str) -> (String, usize) {
    let mut out = String::with_capacity(line.len());
    let mut count = 0;
    let mut rest = line;
    while let Some(pos) = rest.find(ident) {
        let before = if pos > 0 { rest[..pos].chars().next_back() } else { out.chars().next_back() };
        let after = rest[pos + ident.len()..].chars().next();
        out.push_str(&rest[..pos]);
        let starts_token = before.map_or(true, |c| !is_ident_char(c) && c != '.');
        let ends_token = after.map_or(true, |c| !is_ident_char(c));
        if starts_token && ends_token {
            out.push_str(replacement);
            count += 1;
        } else {
            out.push_str(ident);
        }
        rest = &rest[pos + ident.len()..];
    }
    out.push_str(rest);
    (out, count)
}

fn contains_token(line: &str, token: &str) -> bool {
    replace_ident(line, token, "").1 > 0
}

/// Line holding `keyword name` followed by an opening brace, and the line closing it.
fn find_block(lines: &[String], keyword: &str, name: &str) -> Option<(usize, usize, usize)> {
    let header = lines.iter().position(|line| {
        let mut trimmed = line.trim_start();
        while trimmed.starts_with('@') {
            trimmed = trimmed.split_once(' ').map_or("", |(_, rest)| rest.trim_start());
        }
        let Some(rest) = trimmed.strip_prefix(keyword) else {
            return false;
        };
        let rest = rest.trim_start();
        rest.strip_prefix(name).is_some_and(|tail| tail.chars().next().map_or(true, |c| !is_ident_char(c)))
    })?;
    let mut depth = 0i32;
    let mut open = None;
    for (index, line) in lines.iter().enumerate().skip(header) {
        for c in line.chars() {
            match c {
                '{' => {
                    if open.is_none() {
                        open = Some(index);
                    }
                    depth += 1;
                }
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let open = open?;
                        return (open < index).then_some((header, open, index));
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn add_instance_field(lines: &mut Vec<String>, struct_name: &str) -> bool {
    let Some((_, open, close)) = find_block(lines, "struct", struct_name) else {
        return false;
    };
    if lines[open..close].iter().any(|line| contains_token(line, INSTANCE_FIELD)) {
        return true;
    }
    let next_location = lines[open..close]
        .iter()
        .filter_map(|line| {
            let start = line.find("@location(")? + "@location(".len();
            let end = line[start..].find(')')?;
            line[start..start + end].trim().parse::<u32>().ok()
        })
        .max()
        .map_or(0, |max| max + 1);
    let indent = lines.get(open + 1).map(|line| leading_whitespace(line).to_string()).unwrap_or_default();
    let indent = if indent.is_empty() { "    ".to_string() } else { indent };
    lines.insert(close, format!("{indent}@location({next_location}) @interpolate(flat) {INSTANCE_FIELD}: u32,"));
    true
}

/// Expression yielding the instance index inside the vertex entry, adding a parameter
/// when the entry point does not receive one.
fn ensure_instance_index(lines: &mut [String], entry: &str) -> Option<String> {
    let (header, open, _) = find_block(lines, "fn", entry)?;
    let signature = lines[header..=open].join(" ");
    if let Some(name) = builtin_binding_name(&signature) {
        return Some(name);
    }
    for (param, ty) in parameters(&signature) {
        let Some((_, struct_open, struct_close)) = find_block(lines, "struct", &ty) else {
            continue;
        };
        let body = lines[struct_open..=struct_close].join(" ");
        if let Some(field) = builtin_binding_name(&body) {
            return Some(format!("{param}.{field}"));
        }
    }
    let fn_line = &mut lines[header];
    let paren = fn_line.find(&format!("{entry}("))? + entry.len() + 1;
    fn_line.insert_str(paren, &format!("@builtin(instance_index) {INSTANCE_PARAM}: u32, "));
    Some(INSTANCE_PARAM.to_string())
}

fn builtin_binding_name(text: &str) -> Option<String> {
    let start = text.find("@builtin(instance_index)")? + "@builtin(instance_index)".len();
    let name: String = text[start..].trim_start().chars().take_while(|c| is_ident_char(*c)).collect();
    (!name.is_empty()).then_some(name)
}

/// `(name, type)` pairs of a function signature, attributes stripped.
fn parameters(signature: &str) -> Vec<(String, String)> {
    let Some(start) = signature.find('(') else {
        return Vec::new();
    };
    let Some(end) = signature.rfind(')').filter(|end| *end > start) else {
        return Vec::new();
    };
    let list = &signature[start + 1..end];
    // `-> @location(0) T` return types carry their own parens.
    let list = list.split(") ->").next().unwrap_or(list);
    list.split(',')
        .filter_map(|param| {
            let param = param.trim();
            let decl = param.rsplit(')').next().unwrap_or(param).trim();
            let (name, ty) = decl.split_once(':')?;
            Some((name.trim().to_string(), ty.trim().to_string()))
        })
        .filter(|(name, ty)| !name.is_empty() && !ty.is_empty())
        .collect()
}

fn hook_vertex_returns(lines: &mut Vec<String>, surface: &SurfaceShader, instance: &str) -> usize {
    let Some((_, open, close)) = find_block(lines, "fn", &surface.vertex_entry) else {
        return 0;
    };
    let mut hooked = 0;
    for index in (open + 1..close).rev() {
        let trimmed = lines[index].trim();
        let Some(expr) = trimmed.strip_prefix("return ").and_then(|rest| rest.strip_suffix(';')) else {
            continue;
        };
        let expr = expr.trim().to_string();
        let indent = leading_whitespace(&lines[index]).to_string();
        let replacement = vec![
            format!("{indent}{{"),
            format!("{indent}    var sprite_out = {expr};"),
            format!("{indent}    sprite_out.{INSTANCE_FIELD} = {instance};"),
            format!(
                "{indent}    if (sprite_flag({instance}, SPRITE_BILLBOARD, sprite_globals.billboard != 0u)) {{"
            ),
            format!(
                "{indent}        sprite_out.{} = sprite_billboard({}, {}, {}, {});",
                surface.clip_position,
                surface.model_matrix,
                surface.view_matrix,
                surface.projection_matrix,
                surface.local_position
            ),
            format!("{indent}    }}"),
            format!("{indent}    return sprite_out;"),
            format!("{indent}}}"),
        ];
        lines.splice(index..=index, replacement);
        hooked += 1;
    }
    hooked
}

fn is_declaration_line(line: &str) -> bool {
    line.contains("@group") || line.contains("@binding") || line.trim_start().starts_with("struct ")
}

fn patch_fragment_uvs(lines: &mut Vec<String>, surface: &SurfaceShader) -> usize {
    let Some(raw_uv) = surface.uv_idents.first() else {
        return 0;
    };
    let Some((_, open, close)) = find_block(lines, "fn", &surface.fragment_entry) else {
        log::debug!("[shader] fragment entry '{}' not found", surface.fragment_entry);
        return 0;
    };
    let mut replaced = 0;
    for line in &mut lines[open + 1..close] {
        if is_declaration_line(line) {
            continue;
        }
        for ident in &surface.uv_idents {
            let (patched, count) = replace_ident(line, ident, SPRITE_UV);
            if count > 0 {
                *line = patched;
                replaced += count;
            }
        }
    }
    if replaced == 0 {
        return 0;
    }

    // The triangle clip goes right before each return so every sample stays in uniform control flow.
    for index in (open + 1..close).rev() {
        let trimmed = lines[index].trim();
        if !(trimmed.starts_with("return ") || trimmed == "return;") {
            continue;
        }
        let indent = leading_whitespace(&lines[index]).to_string();
        let statement = trimmed.to_string();
        lines.splice(
            index..=index,
            [
                format!("{indent}{{"),
                format!("{indent}    if (SPRITE_TRI_GEOMETRY && sprite_tri_clipped({SPRITE_LOCAL_UV})) {{"),
                format!("{indent}        discard;"),
                format!("{indent}    }}"),
                format!("{indent}    {statement}"),
                format!("{indent}}}"),
            ],
        );
    }

    let indent = lines.get(open + 1).map(|line| leading_whitespace(line).to_string()).unwrap_or_default();
    let indent = if indent.is_empty() { "    ".to_string() } else { indent };
    lines.splice(
        open + 1..open + 1,
        [
            format!("{indent}let {SPRITE_LOCAL_UV} = {raw_uv};"),
            format!(
                "{indent}let {SPRITE_UV} = sprite_frame_uv({}.{INSTANCE_FIELD}, {SPRITE_LOCAL_UV});",
                surface.fragment_input
            ),
        ],
    );
    replaced
}

/// Rebinds the first `let`/`var` holding a `textureSample` result and tints it in place.
fn hook_tint(lines: &mut Vec<String>, surface: &SurfaceShader) -> bool {
    let Some((_, open, close)) = find_block(lines, "fn", &surface.fragment_entry) else {
        return false;
    };
    let found = (open + 1..close).find_map(|index| {
        let trimmed = lines[index].trim_start();
        let rest = trimmed.strip_prefix("let ").or_else(|| trimmed.strip_prefix("var "))?;
        let (lhs, rhs) = rest.split_once('=')?;
        if !rhs.trim_start().starts_with("textureSample") {
            return None;
        }
        let name = lhs.split(':').next()?.trim().to_string();
        (!name.is_empty()).then_some((index, name))
    });
    let Some((index, name)) = found else {
        log::debug!("[shader] no textureSample binding in '{}', tint disabled", surface.fragment_entry);
        return false;
    };
    let Some(end) = (index..close).find(|i| lines[*i].trim_end().ends_with(';')) else {
        return false;
    };
    let indent = leading_whitespace(&lines[index]).to_string();
    let declaration = lines[index].trim_start().to_string();
    if let Some(rest) = declaration.strip_prefix("let ") {
        lines[index] = format!("{indent}var {rest}");
    }
    lines.insert(
        end + 1,
        format!("{indent}{name} = sprite_apply_tint({}.{INSTANCE_FIELD}, {name});", surface.fragment_input),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_whole_tokens_only() {
        let (line, count) = replace_ident("let a = in.uv + in.uv2 + main.in.uv + in.uv.x;", "in.uv", "s");
        assert_eq!(count, 2);
        assert_eq!(line, "let a = s + in.uv2 + main.in.uv + s.x;");
    }

    #[test]
    fn finds_blocks_by_name() {
        let lines: Vec<String> =
            ["struct A {", "  x: f32,", "};", "fn main_a() {", "  if (x) {", "  }", "}"].map(String::from).to_vec();
        assert_eq!(find_block(&lines, "struct", "A"), Some((0, 0, 2)));
        assert_eq!(find_block(&lines, "fn", "main_a"), Some((3, 3, 6)));
        assert_eq!(find_block(&lines, "fn", "main"), None);
    }

    #[test]
    fn parses_entry_parameters() {
        let params = parameters("fn vs(@location(0) p: vec3<f32>, input: VertexInput) -> VertexOutput {");
        assert_eq!(
            params,
            vec![("p".to_string(), "vec3<f32>".to_string()), ("input".to_string(), "VertexInput".to_string())]
        );
    }

    #[test]
    fn reuses_existing_instance_builtin() {
        let mut lines: Vec<String> =
            ["@vertex", "fn vs_main(@builtin(instance_index) idx: u32) -> Out {", "}"].map(String::from).to_vec();
        assert_eq!(ensure_instance_index(&mut lines, "vs_main").as_deref(), Some("idx"));
        assert_eq!(lines[1], "fn vs_main(@builtin(instance_index) idx: u32) -> Out {");
    }

    #[test]
    fn tint_matches_identity_at_defaults() {
        let tint = TintHsv::default();
        let rgb = tint.apply([0.25, 0.5, 0.75]);
        for (out, expected) in rgb.iter().zip([0.25, 0.5, 0.75]) {
            assert!((out - expected).abs() < 1e-6);
        }
        let gray = TintHsv::new(0.0, 0.0, 1.0).apply([1.0, 0.0, 0.0]);
        assert!((gray[0] - 0.2).abs() < 1e-6 && (gray[1] - 0.2).abs() < 1e-6);
        let rotated = TintHsv::new(1.0, 1.0, 1.0).apply([1.0, 0.0, 0.0]);
        assert_eq!(rotated, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn gpu_records_match_wgsl_layout() {
        assert_eq!(std::mem::size_of::<SpriteGlobalsUniform>(), 32);
        assert_eq!(std::mem::size_of::<SpriteInstanceRecord>(), 32);
        assert_eq!(TintHsv::to_uniform(None), [0.0; 4]);
        assert_eq!(TintHsv::to_uniform(Some(TintHsv::new(1.0, 0.5, 2.0))), [1.0, 0.5, 2.0, 1.0]);
    }
}
