//! Test-only helpers: a scratch study tree, synthetic volumes and a
//! scripted stand-in for delegated tools.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use ndarray::Array3;
use nifti::NiftiHeader;
use tempfile::TempDir;

use crate::io::config::{AnatprepConfig, write_config};
use crate::io::nifti_io::{write_mask, write_volume};
use crate::io::process::{ToolExit, ToolInvocation, ToolRunner};
use crate::io::resolver::{SessionResolver, StudyLayout};

/// Shape used by every synthetic volume unless a test asks otherwise.
pub const TEST_SHAPE: (usize, usize, usize) = (8, 8, 8);

/// Acquisition parameters accepted by `load_mp2rage_params`.
pub const MP2RAGE_JSON: &str = r#"{
  "RepetitionTimeExcitation": 0.0062,
  "RepetitionTimePreparation": 5.0,
  "InversionTime": [0.9, 2.75],
  "NumberShots": 192,
  "FlipAngle": [4, 5]
}"#;

/// Header with unit voxels, enough for round-tripping synthetic data.
pub fn test_header() -> NiftiHeader {
    let mut header = NiftiHeader::default();
    header.pixdim = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
    header.sform_code = 1;
    header.srow_x = [1.0, 0.0, 0.0, 0.0];
    header.srow_y = [0.0, 1.0, 0.0, 0.0];
    header.srow_z = [0.0, 0.0, 1.0, 0.0];
    header
}

/// Write a float volume with [`test_header`].
pub fn write_test_volume(path: &Path, data: &Array3<f32>) -> Result<()> {
    write_volume(path, data, &test_header())
}

/// Write a binary mask with [`test_header`].
pub fn write_test_mask(path: &Path, mask: &Array3<bool>) -> Result<()> {
    write_mask(path, mask, &test_header())
}

/// Volume of `TEST_SHAPE` filled with `value`.
pub fn filled(value: f32) -> Array3<f32> {
    Array3::from_elem(TEST_SHAPE, value)
}

/// Mask of `TEST_SHAPE` set inside the central 4×4×4 cube.
pub fn central_cube() -> Array3<bool> {
    Array3::from_shape_fn(TEST_SHAPE, |(x, y, z)| {
        (2..6).contains(&x) && (2..6).contains(&y) && (2..6).contains(&z)
    })
}

/// Scratch study directory that is removed on drop.
pub struct TestStudy {
    dir: TempDir,
    layout: StudyLayout,
}

impl TestStudy {
    /// Empty study with `rawdata/` and `code/`.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp study")?;
        let layout = StudyLayout::new(dir.path());
        fs::create_dir_all(&layout.rawdata_dir)?;
        fs::create_dir_all(&layout.code_dir)?;
        Ok(Self { dir, layout })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn layout(&self) -> &StudyLayout {
        &self.layout
    }

    pub fn session(&self, subject: &str, session: &str) -> SessionResolver {
        self.layout.subject(subject).session(session)
    }

    /// Create `rawdata/sub-X/ses-Y/anat/`.
    pub fn add_session(&self, subject: &str, session: &str) -> Result<SessionResolver> {
        let resolver = self.session(subject, session);
        fs::create_dir_all(&resolver.anat_dir)?;
        Ok(resolver)
    }

    /// Create an empty file under `anat/` (for name-only resolution tests).
    pub fn touch_anat(&self, subject: &str, session: &str, name: &str) -> Result<PathBuf> {
        let resolver = self.add_session(subject, session)?;
        let path = resolver.anat_dir.join(name);
        fs::write(&path, b"")?;
        Ok(path)
    }

    /// Write a real volume under `anat/` or `fmap/`.
    pub fn write_raw(
        &self,
        subject: &str,
        session: &str,
        datatype: &str,
        name: &str,
        data: &Array3<f32>,
    ) -> Result<PathBuf> {
        let resolver = self.add_session(subject, session)?;
        let path = resolver.raw_dir.join(datatype).join(name);
        write_test_volume(&path, data)?;
        Ok(path)
    }

    /// The four MP2RAGE parts plus the combined INV2 for one run, as real
    /// volumes. `run = None` writes untagged files.
    pub fn add_mp2rage_run(&self, subject: &str, session: &str, run: Option<u32>) -> Result<()> {
        let run_tag = run.map(|r| format!("_run-{r}")).unwrap_or_default();
        let inv2 = Array3::from_shape_fn(TEST_SHAPE, |(x, y, z)| (1 + x + y + z) as f32);
        for (inv, part, data) in [
            (1, Some("mag"), filled(50.0)),
            (1, Some("phase"), filled(0.5)),
            (2, Some("mag"), inv2.clone()),
            (2, Some("phase"), filled(0.5)),
            (2, None, inv2.clone()),
        ] {
            let part_tag = part.map(|p| format!("_part-{p}")).unwrap_or_default();
            let name =
                format!("sub-{subject}_ses-{session}{run_tag}_inv-{inv}{part_tag}_MP2RAGE.nii.gz");
            self.write_raw(subject, session, "anat", &name, &data)?;
        }
        Ok(())
    }

    pub fn write_config(&self, cfg: &AnatprepConfig) -> Result<()> {
        write_config(&self.layout.config_path, cfg)
    }

    pub fn write_mp2rage_params(&self) -> Result<()> {
        fs::write(&self.layout.mp2rage_params_path, MP2RAGE_JSON)?;
        Ok(())
    }
}

/// Scripted behavior of one program.
pub struct ScriptedTool {
    pub code: Option<i32>,
    effect: Option<Box<dyn Fn(&ToolInvocation) -> Result<()>>>,
}

impl ScriptedTool {
    pub fn succeed() -> Self {
        Self {
            code: Some(0),
            effect: None,
        }
    }

    pub fn fail(code: i32) -> Self {
        Self {
            code: Some(code),
            effect: None,
        }
    }

    /// Run `effect` (typically: create the tool's output files) before
    /// reporting the exit code.
    pub fn with_effect(mut self, effect: impl Fn(&ToolInvocation) -> Result<()> + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }
}

/// [`ToolRunner`] that records invocations and answers from a script.
///
/// Programs are keyed by [`ToolInvocation::tool_name`]. Running a program
/// with no script is an error, so tests notice unexpected tool calls.
#[derive(Default)]
pub struct ScriptedToolRunner {
    tools: HashMap<String, ScriptedTool>,
    missing: HashSet<String>,
    calls: RefCell<Vec<ToolInvocation>>,
}

impl ScriptedToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, program: &str, tool: ScriptedTool) -> Self {
        self.tools.insert(program.to_string(), tool);
        self
    }

    /// Report `program` as absent from `PATH`.
    pub fn without(mut self, program: &str) -> Self {
        self.missing.insert(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.borrow().clone()
    }

    /// Invocations of one program, in call order.
    pub fn calls_to(&self, program: &str) -> Vec<ToolInvocation> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.tool_name() == program)
            .cloned()
            .collect()
    }
}

impl ToolRunner for ScriptedToolRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolExit> {
        self.calls.borrow_mut().push(invocation.clone());
        let name = invocation.tool_name();
        let tool = self
            .tools
            .get(&name)
            .ok_or_else(|| anyhow!("unscripted tool invoked: {}", invocation.command_line()))?;
        if let Some(effect) = &tool.effect {
            effect(invocation)?;
        }
        Ok(ToolExit { code: tool.code })
    }

    fn is_available(&self, program: &str) -> bool {
        !self.missing.contains(program)
    }
}

/// The value following `flag` in an invocation's arguments.
pub fn arg_after<'a>(invocation: &'a ToolInvocation, flag: &str) -> Option<&'a str> {
    invocation
        .args
        .iter()
        .position(|arg| arg == flag)
        .and_then(|idx| invocation.args.get(idx + 1))
        .map(String::as_str)
}
