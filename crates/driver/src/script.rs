//! Transform-dialect rendering of a transformation history.
//!
//! The script names loops by their position in the nest at the time the step
//! is applied, the same way the descriptors do, so applying the steps in order
//! reproduces the tuned nest.

use looptune_ir::TransformDescriptor;
use std::fmt::Write;

pub fn render_transform_script(function: &str, history: &[TransformDescriptor]) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "module attributes {{transform.with_named_sequence}} {{");
    let _ = writeln!(
        text,
        "  transform.named_sequence @__transform_main(%root: !transform.any_op {{transform.readonly}}) {{"
    );
    let _ = writeln!(
        text,
        "    %f0 = transform.structured.match ops{{[\"func.func\"]}} attributes {{sym_name = \"{}\"}} in %root : (!transform.any_op) -> !transform.any_op",
        function
    );

    for (step, edit) in history.iter().enumerate() {
        let _ = writeln!(text, "    // step {}: {}", step, edit);
        let _ = writeln!(
            text,
            "    %f{} = {} : (!transform.any_op) -> !transform.any_op",
            step + 1,
            step_op(step, edit)
        );
    }

    let _ = writeln!(text, "    transform.yield");
    let _ = writeln!(text, "  }}");
    let _ = writeln!(text, "}}");
    text
}

fn step_op(step: usize, edit: &TransformDescriptor) -> String {
    let handle = format!("%f{}", step);
    match edit {
        TransformDescriptor::Tile { loop_index, size } => format!(
            "transform.looptune.tile {} {{loop = {} : i64, size = {} : i64}}",
            handle, loop_index, size
        ),
        TransformDescriptor::Interchange { permutation } => format!(
            "transform.looptune.interchange {} {{permutation = array<i64: {}>}}",
            handle,
            permutation
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        TransformDescriptor::Parallelize { loop_index } => format!(
            "transform.looptune.parallelize {} {{loop = {} : i64}}",
            handle, loop_index
        ),
        TransformDescriptor::Vectorize { width } => format!(
            "transform.looptune.vectorize {} {{width = {} : i64}}",
            handle, width
        ),
    }
}
