use crate::config::PipelineConfig;
use crate::step::{relative_to, Access, Step, StepId};

/// Render the steps a run starting at `start_from` would execute.
pub fn render_plan(config: &PipelineConfig, steps: &[Step], start_from: StepId) -> String {
    let selected: Vec<&Step> = steps.iter().filter(|s| s.id >= start_from).collect();
    let root = &config.project_root;

    let mut out = String::new();
    out.push_str(&format!("Project root: {}\n", root.display()));
    out.push_str(&format!("Start from:   {}\n", start_from));
    out.push_str(&format!("Steps:        {}\n", selected.len()));

    for step in selected {
        let image = step.image.as_deref().unwrap_or("<in-process>");
        out.push_str(&format!(
            "  {}. {}  image={image} input={} output={}",
            step.ordinal(),
            step.name(),
            relative_to(&step.input_dir, root).display(),
            relative_to(&step.output_dir, root).display(),
        ));
        if let Some(dir) = &step.workdir {
            out.push_str(&format!(" workdir={dir}"));
        }
        if let Some(masks) = &step.masks {
            let mode = match masks.access {
                Access::ReadOnly => "ro",
                Access::ReadWrite => "rw",
            };
            out.push_str(&format!(
                " masks={}:{mode}",
                relative_to(&masks.dir, root).display()
            ));
        }
        if step.gpu {
            out.push_str(" gpu");
        }
        out.push_str(&format!(" expects={}\n", step.expected_output));
    }
    out
}

pub fn print_plan(config: &PipelineConfig, steps: &[Step], start_from: StepId) {
    print!("{}", render_plan(config, steps, start_from));
}
