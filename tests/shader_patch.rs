use instanced_sprites::config::SpriteGeometryKind;
use instanced_sprites::shader::{INSTANCE_FIELD, SPRITE_UNLIT_WGSL};
use instanced_sprites::{SpriteShaderOptions, SpriteShaderPatcher, SurfaceShader};

fn patch(surface: &SurfaceShader, geometry: SpriteGeometryKind) -> instanced_sprites::shader::PatchedShader {
    SpriteShaderPatcher::new(SpriteShaderOptions { bind_group: 3, geometry }).patch(surface)
}

#[test]
fn unlit_shader_is_fully_patched() {
    let patched = patch(&SurfaceShader::sprite_unlit(), SpriteGeometryKind::Quad);
    assert!(patched.vertex_hooked);
    assert!(patched.tint_hooked);
    assert_eq!(patched.replaced_uv_refs, 1);

    let source = &patched.source;
    assert!(source.contains("const SPRITE_TRI_GEOMETRY: bool = false;"));
    assert!(source.contains("@group(3) @binding(0) var<uniform> sprite_globals: SpriteGlobals;"));
    assert!(!source.contains("{{"), "placeholders must be substituted");
    assert!(source.contains(&format!("@location(1) @interpolate(flat) {INSTANCE_FIELD}: u32,")));
    assert!(source.contains("fn vs_main(@builtin(instance_index) sprite_instance_index: u32, input: VertexInput)"));
    assert!(source.contains("sprite_out.sprite_instance = sprite_instance_index;"));
    assert!(source.contains("sprite_billboard(model, camera.view, camera.proj, input.position)"));
    assert!(source.contains("let sprite_local_uv = in.uv;"));
    assert!(source.contains("textureSample(atlas_texture, atlas_sampler, sprite_uv)"));
    assert!(source.contains("var color = textureSample"));
    assert!(source.contains("color = sprite_apply_tint(in.sprite_instance, color);"));
    // The vertex copy of the UV is not a fragment reference.
    assert!(source.contains("out.uv = input.uv;"));
}

#[test]
fn triangle_geometry_enables_clip() {
    let patched = patch(&SurfaceShader::sprite_unlit(), SpriteGeometryKind::Tri);
    assert!(patched.source.contains("const SPRITE_TRI_GEOMETRY: bool = true;"));
    let clip = patched.source.find("sprite_tri_clipped(sprite_local_uv)").expect("clip before return");
    let ret = patched.source.rfind("return color;").expect("fragment return");
    assert!(clip < ret);
}

#[test]
fn existing_instance_builtin_in_input_struct_is_reused() {
    let source = r#"
struct VsIn {
    @builtin(instance_index) id: u32,
    @location(0) position: vec3<f32>,
    @location(1) tex: vec2<f32>,
};

struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) tex: vec2<f32>,
    @location(1) shade: f32,
};

@group(0) @binding(0) var<uniform> view: mat4x4<f32>;
@group(0) @binding(1) var<uniform> proj: mat4x4<f32>;
@group(1) @binding(0) var tex_a: texture_2d<f32>;
@group(1) @binding(1) var tex_s: sampler;

@vertex
fn vert(v: VsIn) -> VsOut {
    var o: VsOut;
    o.pos = proj * view * vec4<f32>(v.position, 1.0);
    o.tex = v.tex;
    o.shade = 1.0;
    return o;
}

@fragment
fn frag(f: VsOut) -> @location(0) vec4<f32> {
    let base: vec4<f32> = textureSample(tex_a, tex_s, f.tex);
    return vec4<f32>(base.rgb * f.shade, base.a);
}
"#;
    let mut surface = SurfaceShader::new(source).with_uv_idents(["f.tex"]);
    surface.vertex_entry = "vert".into();
    surface.fragment_entry = "frag".into();
    surface.vertex_output = "VsOut".into();
    surface.clip_position = "pos".into();
    surface.fragment_input = "f".into();
    surface.model_matrix = "mat4x4<f32>()".into();
    surface.view_matrix = "view".into();
    surface.projection_matrix = "proj".into();
    surface.local_position = "v.position".into();

    let patched = patch(&surface, SpriteGeometryKind::Quad);
    assert!(patched.vertex_hooked);
    assert!(patched.tint_hooked);
    assert_eq!(patched.replaced_uv_refs, 1);
    assert!(patched.source.contains("fn vert(v: VsIn) -> VsOut {"));
    assert!(patched.source.contains("sprite_out.sprite_instance = v.id;"));
    assert!(patched.source.contains("@location(2) @interpolate(flat) sprite_instance: u32,"));
    assert!(patched.source.contains("var base: vec4<f32> = textureSample(tex_a, tex_s, sprite_uv);"));
    assert!(patched.source.contains("base = sprite_apply_tint(f.sprite_instance, base);"));
    assert!(patched.source.contains("let sprite_uv = sprite_frame_uv(f.sprite_instance, sprite_local_uv);"));
}

#[test]
fn unsupported_shader_is_left_inert() {
    let source = "@fragment\nfn fs_main() -> @location(0) vec4<f32> {\n    return vec4<f32>(1.0);\n}\n";
    let patched = patch(&SurfaceShader::new(source), SpriteGeometryKind::Quad);
    assert!(!patched.vertex_hooked);
    assert!(!patched.tint_hooked);
    assert_eq!(patched.replaced_uv_refs, 0);
    assert!(patched.source.ends_with(source));
}

#[test]
fn repatching_reuses_instance_field_and_builtin() {
    let first = patch(&SurfaceShader::sprite_unlit(), SpriteGeometryKind::Quad);
    let second = patch(&SurfaceShader::new(first.source.clone()), SpriteGeometryKind::Quad);
    let field = format!("@interpolate(flat) {INSTANCE_FIELD}: u32");
    assert_eq!(SPRITE_UNLIT_WGSL.matches(&field).count(), 0);
    assert_eq!(first.source.matches(&field).count(), 1);
    assert_eq!(second.source.matches(&field).count(), 1);
    assert_eq!(second.source.matches("@builtin(instance_index)").count(), 1);
}
