use std::fmt;

use crate::task::Task;

/// Todos los problemas encontrados en una tarea, en orden de aparición.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError(pub Vec<String>);

impl ValidationError {
    fn add(&mut self, msg: impl Into<String>) {
        self.0.push(msg.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.0 {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

fn is_abs(p: &str) -> bool {
    p.starts_with('/')
}

pub fn validate(t: &Task) -> Result<(), ValidationError> {
    let mut errs = ValidationError::default();

    if t.executors.is_empty() {
        errs.add("Task.Executors: at least one executor is required");
    }

    for (i, exec) in t.executors.iter().enumerate() {
        if exec.image.is_empty() {
            errs.add(format!("Task.Executors[{i}].Image: required, but empty"));
        }
        if exec.command.is_empty() {
            errs.add(format!("Task.Executors[{i}].Command: required, but empty"));
        }
        for (field, value) in [
            ("Workdir", &exec.workdir),
            ("Stdin", &exec.stdin),
            ("Stdout", &exec.stdout),
            ("Stderr", &exec.stderr),
        ] {
            if !value.is_empty() && !is_abs(value) {
                errs.add(format!("Task.Executors[{i}].{field}: must be an absolute path"));
            }
        }
        for (j, port) in exec.ports.iter().enumerate() {
            if port.container == 0 {
                errs.add(format!(
                    "Task.Executors[{i}].Ports[{j}].Container: required, but empty"
                ));
            }
        }
    }

    for (i, input) in t.inputs.iter().enumerate() {
        if input.path.is_empty() {
            errs.add(format!("Task.Inputs[{i}].Path: required, but empty"));
        } else if !is_abs(&input.path) {
            errs.add(format!("Task.Inputs[{i}].Path: must be an absolute path"));
        }

        if !input.content.is_empty() && !input.url.is_empty() {
            errs.add(format!("Task.Inputs[{i}].Content: Url is non-empty"));
        } else if input.content.is_empty() && input.url.is_empty() {
            errs.add(format!("Task.Inputs[{i}].Url: required, but empty"));
        }
    }

    for (i, output) in t.outputs.iter().enumerate() {
        if output.url.is_empty() {
            errs.add(format!("Task.Outputs[{i}].Url: required, but empty"));
        }
        if output.path.is_empty() {
            errs.add(format!("Task.Outputs[{i}].Path: required, but empty"));
        } else if !is_abs(&output.path) {
            errs.add(format!("Task.Outputs[{i}].Path: must be an absolute path"));
        }
    }

    for (i, vol) in t.volumes.iter().enumerate() {
        if !is_abs(vol) {
            errs.add(format!("Task.Volumes[{i}]: must be an absolute path"));
        }
    }

    if let Some(res) = &t.resources {
        if res.cpu_cores < 0 {
            errs.add("Task.Resources.CpuCores: must be non-negative");
        }
        if res.ram_gb < 0.0 {
            errs.add("Task.Resources.RamGb: must be non-negative");
        }
        if res.disk_gb < 0.0 {
            errs.add("Task.Resources.DiskGb: must be non-negative");
        }
    }

    if t.tags.contains_key("") {
        errs.add("Task.Tags[\"\"]: tag key must be non-empty");
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
