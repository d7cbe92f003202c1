//! Kernel declarations: a name, its WGSL source and its argument contract.

use super::program_group::Arg;
use crate::error::{Error, Result};

/// A declared kernel argument.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub default: Option<Arg>,
}

/// A kernel referenced by name and argument list.
///
/// WGSL kernels follow one binding convention: `@binding(0)` is a uniform
/// block holding the scalar arguments (in declared order, four per `vec4`),
/// and texture arguments take bindings `1..` in declared order.
#[derive(Debug, Clone)]
pub struct ShaderDeclaration {
    name: &'static str,
    wgsl: &'static str,
    arguments: Vec<ArgSpec>,
}

/// Start a declaration for the kernel `name` with the given WGSL source.
pub fn import_shader(name: &'static str, wgsl: &'static str) -> ShaderDeclaration {
    ShaderDeclaration {
        name,
        wgsl,
        arguments: Vec::new(),
    }
}

impl ShaderDeclaration {
    pub fn with_arguments(mut self, names: &[&'static str]) -> Self {
        self.arguments = names.iter().map(|&name| ArgSpec { name, default: None }).collect();
        self
    }

    /// Give a declared argument a default value.
    pub fn with_default(mut self, name: &str, value: impl Into<Arg>) -> Result<Self> {
        let Some(spec) = self.arguments.iter_mut().find(|spec| spec.name == name) else {
            return Err(Error::IllegalArgument(format!(
                "kernel '{}' declares no argument '{name}' to default",
                self.name
            )));
        };
        spec.default = Some(value.into());
        Ok(self)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn wgsl(&self) -> &'static str {
        self.wgsl
    }

    pub fn arguments(&self) -> &[ArgSpec] {
        &self.arguments
    }

    pub fn declares(&self, name: &str) -> bool {
        self.arguments.iter().any(|spec| spec.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_declared_arguments_only() {
        let shader = import_shader("keypoints/multiscale-harris", "")
            .with_arguments(&["image", "windowRadius"])
            .with_default("windowRadius", 3u32)
            .unwrap();
        assert!(matches!(shader.arguments()[1].default, Some(Arg::Scalar(r)) if r == 3.0));
        assert!(shader.arguments()[0].default.is_none());

        let undeclared = import_shader("keypoints/multiscale-harris", "")
            .with_arguments(&["image"])
            .with_default("radius", 3u32);
        assert!(matches!(undeclared, Err(Error::IllegalArgument(_))));
    }
}
