use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::process::Command;

use hcapi::{BackendInfo, Device, MetalFamily, MetalPlatform, MetalVersion, OpenClVersion, Os};
use tempfile::TempPath;

use crate::defines::emit_device_defines;
use crate::function_info::parse_function_info_file;
use crate::target::{CompileOptions, ProgramData, ProgramOutput, Target};
use crate::{Result, ToolchainError};

/// Location of one vendored clang toolchain.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub compiler: PathBuf,
    /// Directory containing the `libcxx`, `clang` and `include` trees.
    pub base_path: PathBuf,
    pub version: u32,
}

impl ToolPaths {
    fn libcxx_path(&self) -> PathBuf {
        self.base_path.join("libcxx")
    }

    fn clang_path(&self) -> PathBuf {
        self.base_path.join("clang")
    }

    fn include_path(&self) -> PathBuf {
        self.base_path.join("include")
    }
}

/// SPIR-V validation/optimisation tool configuration for one backend.
#[derive(Debug, Clone, Default)]
pub struct SpirvTools {
    pub validate: bool,
    pub validator: PathBuf,
    pub optimizer: PathBuf,
}

/// The toolchain handle: per-target tool locations plus build policy. This
/// replaces process-global configuration; callers construct (or load) one and
/// hand it to every compile call.
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    pub opencl: Option<ToolPaths>,
    pub metal: Option<ToolPaths>,
    pub cuda: Option<ToolPaths>,
    pub vulkan: Option<ToolPaths>,
    pub host: Option<ToolPaths>,

    pub opencl_spirv: SpirvTools,
    pub vulkan_spirv: SpirvTools,
    /// Pass `-cl-verify-spir` for SPIR 1.2 builds.
    pub opencl_verify_spir: bool,

    /// Emit line-table debug info for all builds.
    pub debug: bool,
    /// Keep temporary outputs and side-channel files.
    pub keep_temp: bool,
    /// Log every compiler command line.
    pub log_commands: bool,

    pub cuda_force_sm: Option<String>,
    pub cuda_force_ptx: Option<u32>,
    pub metal_force_version: Option<u32>,
    pub metal_soft_printf: bool,
    pub vulkan_soft_printf: bool,
}

/// Everything needed to run (and post-process) one build.
#[derive(Debug)]
struct BuildPlan {
    clang_cmd: String,
    /// Output file; `temp` owns deletion for intermediate artifacts.
    output_path: PathBuf,
    output_temp: Option<TempPath>,
    /// Side-channel function-info file (absent for PCH builds).
    function_info: Option<TempPath>,
    /// Second Metal compile step (preprocess-condense mode).
    metal_pp_cmd: Option<String>,
    metal_final_output: Option<TempPath>,
}

/// Vulkan requires this many descriptor sets before the regular binding
/// model can be used.
const MIN_REQUIRED_HIGH_BOUND_DESCRIPTOR_SETS: u32 = 8;

const DISABLED_WARNING_FLAGS: &str = concat!(
    // let's start with everything
    " -Weverything",
    // remove compat warnings
    " -Wno-c++98-compat -Wno-c++98-compat-pedantic",
    " -Wno-c++11-compat -Wno-c++11-compat-pedantic",
    " -Wno-c++14-compat -Wno-c++14-compat-pedantic",
    " -Wno-c++17-compat -Wno-c++17-compat-pedantic",
    " -Wno-c++20-compat -Wno-c++20-compat-pedantic -Wno-c++20-extensions",
    " -Wno-c++2b-compat -Wno-c++2b-compat-pedantic -Wno-c++2b-extensions",
    " -Wno-c99-extensions -Wno-c11-extensions",
    " -Wno-gcc-compat -Wno-gnu",
    // in case we're using warning options that aren't supported by other clang versions
    " -Wno-unknown-warning-option",
    // really don't want to be too pedantic
    " -Wno-old-style-cast -Wno-date-time -Wno-system-headers -Wno-header-hygiene",
    // again: not too pedantic, also useful language features
    " -Wno-nested-anon-types -Wno-global-constructors -Wno-exit-time-destructors",
    // usually conflicting with the other switch/case warning
    " -Wno-switch-enum",
    // don't warn when using macros prefixed with "__" or "_"
    " -Wno-reserved-id-macro -Wno-reserved-identifier",
    " -Wno-return-std-move-in-c++11",
    // ignore documentation warnings
    " -Wno-documentation -Wno-documentation-unknown-command",
    // don't complain about "#pragma once" when compiling an .hpp as a main file
    " -Wno-pragma-once-outside-header",
    " ",
);

fn str_hex_escape(code: &str) -> String {
    let mut escaped = String::with_capacity(code.len() * 4);
    for byte in code.bytes() {
        escaped.push_str(&format!("\\x{byte:02X}"));
    }
    escaped
}

fn execute_shell(cmd: &str) -> Result<String> {
    let output = Command::new("sh").arg("-c").arg(cmd).output()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

fn output_contains_errors(output: &str) -> bool {
    output.contains(" error: ") || output.contains(" errors:")
}

impl Toolchain {
    /// Compile `code` by piping it into the compiler.
    pub fn compile_program(&self, dev: &Device, code: &str, options: CompileOptions)
        -> Result<ProgramData> {
        let cmd_prefix = format!("printf \"{}\" | ", str_hex_escape(code));
        self.compile_input("-", &cmd_prefix, dev, options, false)
    }

    /// Compile a source file.
    pub fn compile_program_file(&self, dev: &Device, filename: &Path, options: CompileOptions)
        -> Result<ProgramData> {
        self.compile_input(&format!("\"{}\"", filename.display()), "", dev, options, false)
    }

    /// Build the common-header PCH for a target; there is no source input.
    pub fn compile_precompiled_header(&self, pch_output_file_name: &Path, dev: &Device,
                                      options: CompileOptions) -> Result<ProgramData> {
        let mut options = options;
        options.pch = Some(pch_output_file_name.to_path_buf());
        self.compile_input("", "", dev, options, true)
    }

    fn compile_input(&self, input: &str, cmd_prefix: &str, dev: &Device,
                     options: CompileOptions, build_pch: bool) -> Result<ProgramData> {
        let mut plan = self.assemble(input, cmd_prefix, dev, &options, build_pch)?;

        if self.log_commands && !options.silence_debug_output {
            log::debug!("clang cmd: {}", plan.clang_cmd);
            if let Some(pp_cmd) = &plan.metal_pp_cmd {
                log::debug!("Metal final cmd: {pp_cmd}");
            }
        }

        let compilation_output = execute_shell(&plan.clang_cmd)?;
        // can't trust the exit code through the pipeline; scan for error markers
        if output_contains_errors(&compilation_output) {
            log::error!("compilation failed! failed cmd was:\n{}", plan.clang_cmd);
            log::error!("compilation errors:\n{compilation_output}");
            return Err(ToolchainError::Compilation);
        }
        if !compilation_output.is_empty() && !options.silence_debug_output {
            log::debug!("compilation output:\n{compilation_output}");
        }

        // Metal preprocess-condense mode: compile the preprocessed source
        // into the actual metallib now.
        if let Some(pp_cmd) = &plan.metal_pp_cmd {
            let pp_output = execute_shell(pp_cmd)?;
            if output_contains_errors(&pp_output) {
                log::error!("final Metal compilation failed! failed cmd was:\n{pp_cmd}");
                log::error!("final Metal compilation errors:\n{pp_output}");
                return Err(ToolchainError::Compilation);
            }
            if !pp_output.is_empty() && !options.silence_debug_output {
                log::debug!("final Metal compilation output:\n{pp_output}");
            }
            let final_temp = plan.metal_final_output.take().expect("planned with pp step");
            plan.output_path = final_temp.to_path_buf();
            plan.output_temp = Some(final_temp);
        }

        // grab the function info side channel
        let mut functions = Vec::new();
        if !build_pch {
            let ffi_path = plan.function_info.take().expect("non-PCH builds have a side channel");
            functions = parse_function_info_file(&ffi_path)?;
            if self.keep_temp {
                ffi_path.keep().map_err(|e| ToolchainError::Io(e.error))?;
            }
        }

        let output = self.post_process(dev, &options, build_pch, plan)?;
        Ok(ProgramData { output, functions, options })
    }

    fn post_process(&self, dev: &Device, options: &CompileOptions, build_pch: bool,
                    plan: BuildPlan) -> Result<ProgramOutput> {
        if build_pch {
            return Ok(ProgramOutput::File(plan.output_path));
        }
        match options.target {
            Target::Spir => {
                let data = std::fs::read(&plan.output_path).map_err(|e| {
                    log::error!("failed to read SPIR 1.2 .bc file: {e}");
                    ToolchainError::Io(e)
                })?;
                self.finish_temp(plan.output_temp)?;
                Ok(ProgramOutput::Bytes(data))
            }
            Target::Ptx => {
                let ptx_code = std::fs::read_to_string(&plan.output_path).map_err(|e| {
                    log::error!("PTX compilation failed: {e}");
                    ToolchainError::Io(e)
                })?;
                self.finish_temp(plan.output_temp)?;
                if ptx_code.is_empty() || !ptx_code.contains("Generated by LLVM NVPTX Back-End") {
                    log::error!("PTX compilation failed!\n{ptx_code}");
                    return Err(ToolchainError::Compilation);
                }
                // explicit zero terminator, the module loader has no length input
                let ptx = CString::new(ptx_code)
                    .map_err(|_| ToolchainError::Unsupported("PTX contains NUL bytes".into()))?;
                Ok(ProgramOutput::Text(ptx))
            }
            Target::SpirvVulkan | Target::SpirvOpencl => {
                self.spirv_validate_and_opt(dev, options, &plan.output_path)?;
                self.keep_output(plan)
            }
            // the metallib / ELF binary is consumed from disk by the backend
            Target::Air | Target::HostCompute => self.keep_output(plan),
        }
    }

    /// Persist a file output: the artifact outlives the build and is cleaned
    /// up by the backend driver that consumes it.
    fn keep_output(&self, plan: BuildPlan) -> Result<ProgramOutput> {
        if let Some(temp) = plan.output_temp {
            let path = temp.keep().map_err(|e| ToolchainError::Io(e.error))?;
            Ok(ProgramOutput::File(path))
        } else {
            Ok(ProgramOutput::File(plan.output_path))
        }
    }

    /// Delete an intermediate output unless `keep_temp` asks otherwise.
    fn finish_temp(&self, temp: Option<TempPath>) -> Result<()> {
        if let Some(temp) = temp {
            if self.keep_temp {
                temp.keep().map_err(|e| ToolchainError::Io(e.error))?;
            }
            // drop deletes otherwise
        }
        Ok(())
    }

    fn spirv_validate_and_opt(&self, dev: &Device, options: &CompileOptions, file: &Path)
        -> Result<()> {
        let is_vulkan = options.target == Target::SpirvVulkan;
        let tools = if is_vulkan { &self.vulkan_spirv } else { &self.opencl_spirv };

        let run_validation = |label: &str| -> Result<()> {
            if !tools.validate {
                return Ok(());
            }
            let validator_opts = if is_vulkan {
                "--target-env vulkan1.3 --uniform-buffer-standard-layout --scalar-block-layout \
                 --workgroup-scalar-block-layout"
                    .to_string()
            } else {
                let BackendInfo::OpenCl { cl_version, .. } = &dev.backend else {
                    return Err(ToolchainError::DeviceMismatch("OpenCL"));
                };
                match cl_version {
                    OpenClVersion::Cl10 | OpenClVersion::Cl11 => {
                        log::error!("unsupported OpenCL version");
                        return Err(ToolchainError::Unsupported("OpenCL version".into()));
                    }
                    OpenClVersion::Cl12 => "--target-env opencl1.2".to_string(),
                    OpenClVersion::Cl20 => "--target-env opencl2.0".to_string(),
                    OpenClVersion::Cl21 => "--target-env opencl2.1".to_string(),
                    // TODO: no 3.0 target env in spirv-val yet
                    OpenClVersion::Cl22 | OpenClVersion::Cl30 => {
                        "--target-env opencl2.2".to_string()
                    }
                }
            };
            let cmd = format!("\"{}\" {validator_opts} {} 2>&1", tools.validator.display(),
                              file.display());
            let mut validator_output = execute_shell(&cmd)?;
            if validator_output.ends_with('\n') {
                validator_output.pop();
            }
            if !options.silence_debug_output {
                if validator_output.is_empty() {
                    log::debug!("SPIR-V validator ({label}): valid");
                } else {
                    log::error!("SPIR-V validator ({label}):\n{validator_output}");
                }
            }
            Ok(())
        };

        let label = if is_vulkan { "Vulkan" } else { "OpenCL" };
        run_validation(label)?;

        if is_vulkan && options.vulkan.run_opt {
            let opt_options = options.vulkan.opt_overrides.clone().unwrap_or_else(|| {
                "-O --unify-const --compact-ids --trim-capabilities --preserve-bindings \
                 --preserve-interface --preserve-spec-constants"
                    .to_string()
            });
            let cmd = format!("\"{}\" {opt_options} {} -o {} 2>&1", tools.optimizer.display(),
                              file.display(), file.display());
            let mut opt_output = execute_shell(&cmd)?;
            if opt_output.ends_with('\n') {
                opt_output.pop();
            }
            if !options.silence_debug_output {
                if opt_output.is_empty() {
                    log::debug!("SPIR-V opt ({label}): success");
                } else {
                    log::error!("SPIR-V opt ({label}): failure\n{opt_output}");
                }
            }
            // the module changed, validate once more
            run_validation(label)?;
        }
        Ok(())
    }

    /// Assemble the full compiler invocation for one build.
    fn assemble(&self, input: &str, cmd_prefix: &str, dev: &Device, options: &CompileOptions,
                build_pch: bool) -> Result<BuildPlan> {
        let mut clang_cmd = String::from(cmd_prefix);
        let mut output_file_type = "bc";
        let mut metal_emit_format = String::new();
        let mut metal_os_override = None;
        let mut sm_version = String::from("50");
        let mut sm_aa_enabled = false;
        let mut ptx_version = options.cuda.ptx_version.max(80);
        let metal_preprocess =
            options.target == Target::Air && options.debug.preprocess_condense && !build_pch;
        // something may need to override device capabilities here
        let disable_sub_groups = false;

        let tools = match options.target {
            Target::Spir | Target::SpirvOpencl => {
                self.opencl.as_ref().ok_or(ToolchainError::MissingToolchain("OpenCL"))?
            }
            Target::Air => self.metal.as_ref().ok_or(ToolchainError::MissingToolchain("Metal"))?,
            Target::Ptx => self.cuda.as_ref().ok_or(ToolchainError::MissingToolchain("CUDA"))?,
            Target::SpirvVulkan => {
                self.vulkan.as_ref().ok_or(ToolchainError::MissingToolchain("Vulkan"))?
            }
            Target::HostCompute => {
                self.host.as_ref().ok_or(ToolchainError::MissingToolchain("Host-Compute"))?
            }
        };
        let compiler = tools.compiler.display().to_string();
        let toolchain_version = tools.version;

        match options.target {
            Target::Spir => {
                clang_cmd += &format!(
                    "\"{compiler}\" -x {}{} -Xclang -cl-std=CL1.2 -target spir64-unknown-unknown \
                     -Xclang -cl-sampler-type -Xclang i32 -Xclang -cl-kernel-arg-info \
                     -Xclang -cl-mad-enable -Xclang -cl-fast-relaxed-math \
                     -Xclang -cl-unsafe-math-optimizations -Xclang -cl-finite-math-only \
                     -DHC_DEVICE_OPENCL -DHC_DEVICE_SPIR \
                     -DHC_DEVICE_OPENCL_MAJOR=1 -DHC_DEVICE_OPENCL_MINOR=2",
                    if !build_pch { "cl" } else { "cl-header" },
                    if !build_pch { " -Xclang -llvm-bc-32 -cl-no-stdinc" } else { "" },
                );
                if !dev.double_support {
                    clang_cmd += " -DHC_DEVICE_NO_DOUBLE";
                }
                if self.opencl_verify_spir {
                    clang_cmd += " -Xclang -cl-verify-spir";
                }
                if dev.platform_vendor == hcapi::Vendor::Intel
                    && dev.vendor == hcapi::Vendor::Intel {
                    clang_cmd += " -Xclang -cl-spir-intel-workarounds";
                }
                clang_cmd += " -mllvm -slp-vectorize-hor=false";
            }
            Target::Air => {
                let BackendInfo::Metal { platform, family, language_version, simd_reduction } =
                    &dev.backend
                else {
                    return Err(ToolchainError::DeviceMismatch("Metal"));
                };
                output_file_type = "metallib";

                let mut metal_version = *language_version;
                if !options.ignore_runtime_info {
                    if let Some(force_version) = self.metal_force_version {
                        metal_version = match force_version {
                            30 => MetalVersion::Metal3_0,
                            31 => MetalVersion::Metal3_1,
                            32 => MetalVersion::Metal3_2,
                            40 => MetalVersion::Metal4_0,
                            other => {
                                log::error!("invalid force_version: {other}");
                                metal_version
                            }
                        };
                    }
                }

                let os_target = match platform {
                    MetalPlatform::Ios | MetalPlatform::IosSimulator => match metal_version {
                        MetalVersion::Metal3_0 => "ios16.0.0",
                        MetalVersion::Metal3_1 => "ios17.0.0",
                        MetalVersion::Metal3_2 => "ios18.0.0",
                        MetalVersion::Metal4_0 => "ios26.0.0",
                    },
                    MetalPlatform::Visionos | MetalPlatform::VisionosSimulator => {
                        match metal_version {
                            MetalVersion::Metal4_0 => "xros26.0.0",
                            _ => "xros2.0.0",
                        }
                    }
                    MetalPlatform::Macos => match metal_version {
                        MetalVersion::Metal3_0 => "macosx13.0.0",
                        MetalVersion::Metal3_1 => "macosx14.0.0",
                        MetalVersion::Metal3_2 => "macosx15.0.0",
                        MetalVersion::Metal4_0 => "macosx16.0.0",
                    },
                };
                let simulator_suffix = if platform.is_simulator() { "-simulator" } else { "" };
                let air_target = if metal_version >= MetalVersion::Metal4_0 {
                    "air64_v28"
                } else {
                    "air64"
                };

                let soft_printf = options.metal.soft_printf.unwrap_or(self.metal_soft_printf);
                if !build_pch {
                    metal_emit_format = " -Xclang -emit-metallib".to_string();
                }

                clang_cmd += &format!(
                    "\"{compiler}\" -x {} -std={} -target {air_target}-apple-{os_target}{simulator_suffix}",
                    if !build_pch { "metal" } else { "metal-header" },
                    metal_version.std_name(),
                );
                if cfg!(target_os = "macos") && dev.vendor == hcapi::Vendor::Intel {
                    // always work around Intel conversion problems
                    clang_cmd += " -Xclang -metal-intel-workarounds";
                }
                if soft_printf {
                    clang_cmd += " -Xclang -metal-soft-printf -DHC_DEVICE_HAS_SOFT_PRINTF=1";
                }
                clang_cmd += &format!(
                    " -Xclang -cl-mad-enable -Xclang -cl-fast-relaxed-math \
                     -Xclang -cl-unsafe-math-optimizations -Xclang -cl-finite-math-only \
                     -DHC_DEVICE_NO_DOUBLE -DHC_DEVICE_METAL \
                     -DHC_DEVICE_METAL_MAJOR={} -DHC_DEVICE_METAL_MINOR={} \
                     -mllvm -slp-vectorize-hor=false",
                    metal_version.major(),
                    metal_version.minor(),
                );
                let simd_reduction = u32::from(*simd_reduction);
                clang_cmd += &format!(
                    " -DHC_DEVICE_METAL_HAS_SIMD_REDUCTION={simd_reduction} \
                     -DHC_DEVICE_METAL_HAS_SIMD_REDUCTION_{simd_reduction}"
                );
                metal_os_override = Some(if *family == MetalFamily::Apple {
                    Os::Ios
                } else {
                    Os::Macos
                });
            }
            Target::Ptx => {
                let BackendInfo::Cuda { sm, sm_aa } = &dev.backend else {
                    return Err(ToolchainError::DeviceMismatch("CUDA"));
                };
                output_file_type = "ptx";

                sm_version = match (&self.cuda_force_sm, options.ignore_runtime_info) {
                    (Some(force_sm), false) => force_sm.clone(),
                    _ => format!("{}", sm.0 * 10 + sm.1),
                };
                // architecture-accelerated codegen for runtime builds on sm_90+
                sm_aa_enabled = sm.0 >= 9 && (*sm_aa || !options.ignore_runtime_info);

                // minimum PTX ISA per sm tier
                ptx_version = match sm.0 {
                    5..=7 => ptx_version,
                    8 => {
                        if sm.1 == 8 {
                            ptx_version.max(90)
                        } else {
                            ptx_version
                        }
                    }
                    9 => ptx_version.max(if sm.1 == 0 { 80 } else { 86 }),
                    10 => ptx_version.max(if sm.1 <= 1 { 86 } else { 88 }),
                    11 => ptx_version.max(90),
                    12 => ptx_version.max(if sm.1 == 0 { 87 } else { 88 }),
                    _ => ptx_version.max(90),
                };
                if !options.ignore_runtime_info {
                    if let Some(forced) = self.cuda_force_ptx {
                        if forced >= 80 {
                            ptx_version = forced;
                        }
                    }
                }

                clang_cmd += &format!(
                    "\"{compiler}\" -x {} -std=cuda -target x86_64-- \
                     -nocudalib -nocudainc --cuda-device-only --cuda-gpu-arch=sm_{sm_version}{} \
                     -Xclang -target-feature -Xclang +ptx{ptx_version} \
                     -Xclang -fcuda-is-device -DHC_DEVICE_CUDA",
                    if !build_pch { "cuda" } else { "cuda-header" },
                    if sm_aa_enabled { "a" } else { "" },
                );
                if options.cuda.short_ptr {
                    clang_cmd += " -fcuda-short-ptr -mllvm --nvptx-short-ptr";
                }
            }
            Target::SpirvVulkan => {
                let BackendInfo::Vulkan {
                    version,
                    max_inline_uniform_block_size,
                    max_inline_uniform_block_count,
                    subgroup_uniform_cf_support,
                    max_descriptor_set_count,
                    ..
                } = &dev.backend
                else {
                    return Err(ToolchainError::DeviceMismatch("Vulkan"));
                };
                output_file_type = "spvc";

                let soft_printf = options.vulkan.soft_printf.unwrap_or(self.vulkan_soft_printf);

                // still compiling this as OpenCL for now
                clang_cmd += &format!(
                    "\"{compiler}\" -x {}{} -std={} -target spir64-unknown-unknown-vulkan \
                     -Xclang -cl-sampler-type -Xclang i32 -Xclang -cl-kernel-arg-info \
                     -Xclang -cl-mad-enable -Xclang -cl-fast-relaxed-math \
                     -Xclang -cl-unsafe-math-optimizations -Xclang -cl-finite-math-only \
                     -Xclang -vulkan-iub-size={max_inline_uniform_block_size} \
                     -Xclang -vulkan-iub-count={max_inline_uniform_block_count}",
                    if !build_pch { "vulkan" } else { "vulkan-header" },
                    if !build_pch { " -Xclang -emit-spirv-container" } else { "" },
                    version.std_name(),
                );
                if soft_printf {
                    clang_cmd += " -Xclang -vulkan-soft-printf -DHC_DEVICE_HAS_SOFT_PRINTF=1";
                }
                if options.vulkan.pre_structurization_pass {
                    clang_cmd += " -Xclang -vulkan-llvm-pre-structurization-pass";
                }
                if *subgroup_uniform_cf_support {
                    clang_cmd += " -Xclang -vulkan-subgroup-uniform-cf";
                }
                if *max_descriptor_set_count < MIN_REQUIRED_HIGH_BOUND_DESCRIPTOR_SETS {
                    clang_cmd += " -Xclang -vulkan-low-descriptor-set-count";
                }
                // TODO: fix Vulkan double support
                clang_cmd += " -DHC_DEVICE_VULKAN -DHC_DEVICE_SPIRV -DHC_DEVICE_NO_DOUBLE \
                              -mllvm -slp-vectorize-hor=false";
            }
            Target::SpirvOpencl => {
                let BackendInfo::OpenCl { cl_version, spirv_version } = &dev.backend else {
                    return Err(ToolchainError::DeviceMismatch("OpenCL"));
                };
                output_file_type = "spv";
                if spirv_version.is_none() {
                    log::error!("SPIR-V is not supported by this device!");
                    return Err(ToolchainError::Unsupported("no device SPIR-V support".into()));
                }

                // compile to the max OpenCL standard the device supports
                clang_cmd += &format!(
                    "\"{compiler}\" -x {}{} -Xclang -cl-std=CL{} \
                     -target spir64-unknown-unknown \
                     -Xclang -cl-sampler-type -Xclang i32 -Xclang -cl-kernel-arg-info \
                     -Xclang -cl-mad-enable -Xclang -cl-fast-relaxed-math \
                     -Xclang -cl-unsafe-math-optimizations -Xclang -cl-finite-math-only \
                     -DHC_DEVICE_OPENCL -DHC_DEVICE_SPIRV \
                     -DHC_DEVICE_OPENCL_MAJOR={} -DHC_DEVICE_OPENCL_MINOR={}",
                    if !build_pch { "cl" } else { "cl-header" },
                    if !build_pch { " -Xclang -emit-spirv -cl-no-stdinc" } else { "" },
                    cl_version.as_str(),
                    cl_version.major(),
                    cl_version.minor(),
                );
                if !dev.double_support {
                    clang_cmd += " -DHC_DEVICE_NO_DOUBLE";
                }
                clang_cmd += " -mllvm -slp-vectorize-hor=false";
            }
            Target::HostCompute => {
                let BackendInfo::Host { cpu_tier } = &dev.backend else {
                    return Err(ToolchainError::DeviceMismatch("Host-Compute"));
                };
                output_file_type = "bin";

                clang_cmd += &format!(
                    "\"{compiler}\" -x {} -std=gnu++2b \
                     -target {}-pc-none-hostcompute \
                     -nostdinc -fbuiltin -fno-math-errno -fPIC -march={}",
                    if !build_pch { "c++" } else { "c++-header" },
                    cpu_tier.target_arch(),
                    cpu_tier.march(),
                );
                if let Some(tune) = cpu_tier.mtune() {
                    clang_cmd += &format!(" -mtune={tune}");
                }
                if let Some(width) = cpu_tier.prefer_vector_width() {
                    // override default behavior of preferring 256-bit
                    clang_cmd += &format!(" -mprefer-vector-width={width}");
                }
                // must be relocatable; doubles are not supported for now
                clang_cmd += " -mcmodel=large -DHC_DEVICE_HOST_COMPUTE_IS_DEVICE \
                              -DHC_DEVICE_HOST_COMPUTE -DHC_DEVICE_NO_DOUBLE \
                              -fno-stack-protector";
            }
        }

        // pch handling
        let mut pch_include = String::new();
        if build_pch {
            output_file_type = "pch";
        } else if let Some(pch) = &options.pch {
            pch_include = format!(" -include-pch {}", pch.display());
        }

        clang_cmd += &format!(" -DHC_TOOLCHAIN_VERSION={toolchain_version}u");

        emit_device_defines(&mut clang_cmd, dev, options, dev.primitive_id_support,
                            dev.barycentric_coord_support, disable_sub_groups, metal_os_override);

        // function info side channel
        let mut function_info = None;
        if !build_pch {
            let ffi = tempfile::Builder::new().prefix("ffi_").suffix(".txt").tempfile()?;
            let ffi_path = ffi.into_temp_path();
            clang_cmd += &format!(" -Xclang -hc-function-info={}", ffi_path.display());
            function_info = Some(ffi_path);
        }

        // target specific versions
        match options.target {
            Target::Ptx => {
                clang_cmd += &format!(" -DHC_DEVICE_INFO_CUDA_SM={sm_version}");
                clang_cmd +=
                    &format!(" -DHC_DEVICE_INFO_CUDA_SM_AA={}", u32::from(sm_aa_enabled));
                clang_cmd += &format!(" -DHC_DEVICE_INFO_CUDA_PTX={ptx_version}");
            }
            Target::SpirvVulkan => {
                if let BackendInfo::Vulkan { float16_support, .. } = &dev.backend {
                    let f16 = u32::from(*float16_support);
                    clang_cmd += &format!(
                        " -DHC_DEVICE_INFO_VULKAN_HAS_FLOAT16_SUPPORT={f16} \
                         -DHC_DEVICE_INFO_VULKAN_HAS_FLOAT16_SUPPORT_{f16}"
                    );
                }
            }
            _ => {}
        }

        // debug info; SPIR 1.2 consumers choke on it
        let mut metal_debug_preprocess = String::new();
        let mut metal_final_output_file_type = "";
        if ((self.debug && !options.ignore_runtime_info) || options.debug.emit_debug_info)
            && options.target != Target::Spir {
            clang_cmd += " -gline-tables-only";
            if options.target == Target::Air {
                clang_cmd += " -gstrict-dwarf -gcolumn-info -frecord-command-line";
            }
        }
        if metal_preprocess {
            metal_debug_preprocess = " -E -P".to_string();
            if options.debug.preprocess_preserve_comments {
                metal_debug_preprocess += " -C";
            }
            metal_final_output_file_type = output_file_type;
            output_file_type = "cpp";
        }

        let include_flags = format!(
            " -isystem \"{}\" -isystem \"{}\" -isystem \"{}\" -include hc/device/backend/common.hpp{}",
            tools.libcxx_path().display(),
            tools.clang_path().display(),
            tools.include_path().display(),
            pch_include,
        );

        // flags that are always used
        if cfg!(debug_assertions) {
            clang_cmd += " -DHC_DEBUG";
        }
        clang_cmd += " -DHC_DEVICE -DHC_NO_MATH_STR";
        if !metal_preprocess {
            clang_cmd += &include_flags;
        }
        if options.target != Target::HostCompute {
            clang_cmd += " -fno-pic";
        }
        clang_cmd += " -fno-exceptions -fno-unwind-tables -fno-asynchronous-unwind-tables \
                      -fno-addrsig -fno-rtti -fstrict-aliasing -ffast-math -funroll-loops \
                      -Ofast -ffp-contract=fast -Xclang -menable-unsafe-fp-math";
        // increase limit from 16 to 64, this "fixes" some forced unrolling
        clang_cmd += " -mllvm -rotation-max-header-size=64";
        clang_cmd += " -fintegrated-cc1 -flegacy-pass-manager -Xclang -no-round-trip-args";
        // force enable half/fp16 support on all targets
        clang_cmd += " -Xclang -fnative-half-type -Xclang -fnative-half-arguments-and-returns \
                      -Xclang -fallow-half-arguments-and-returns";
        // note that enabling warnings costs a significant amount of compilation time
        clang_cmd += if options.enable_warnings { " -Weverything" } else { " " };
        clang_cmd += DISABLED_WARNING_FLAGS;
        clang_cmd += &options.cli;
        clang_cmd += " -m64";

        // output file
        let output_path;
        let mut output_temp = None;
        if !build_pch {
            let out = tempfile::Builder::new()
                .suffix(&format!(".{output_file_type}"))
                .tempfile()?
                .into_temp_path();
            output_path = out.to_path_buf();
            output_temp = Some(out);
            if options.target != Target::HostCompute && options.target != Target::Ptx {
                clang_cmd += " -emit-llvm";
            }
            if !metal_preprocess {
                if options.target == Target::Ptx {
                    clang_cmd += " -S";
                } else {
                    clang_cmd += " -c";
                }
                clang_cmd += &format!(" -o {} {input}", output_path.display());
            } else {
                metal_debug_preprocess += &format!(" -o {} {input}", output_path.display());
            }
        } else {
            output_path = options.pch.clone().expect("PCH builds carry the output name");
            clang_cmd += &format!(" \"{}/hc/device/backend/common.hpp\"",
                                  tools.include_path().display());
            clang_cmd += &format!(" -o {}", output_path.display());
        }

        // Metal two-step compilation: .cpp -> .ii -> .metallib
        let mut metal_pp_cmd = None;
        let mut metal_final_output = None;
        if metal_preprocess {
            let final_out = tempfile::Builder::new()
                .suffix(&format!(".{metal_final_output_file_type}"))
                .tempfile()?
                .into_temp_path();
            let mut pp_cmd = clang_cmd.clone();
            pp_cmd += &metal_emit_format;
            pp_cmd += " -Wno-everything";
            pp_cmd += &format!(" -emit-llvm -c -o {} {}", final_out.display(),
                               output_path.display());
            pp_cmd += " 2>&1";
            metal_pp_cmd = Some(pp_cmd);
            metal_final_output = Some(final_out);

            clang_cmd += &include_flags;
            clang_cmd += &metal_debug_preprocess;
        } else if options.target == Target::Air {
            clang_cmd += &metal_emit_format;
        }

        // redirect errors to stdout so they can be grabbed from the pipeline
        clang_cmd += " 2>&1";

        Ok(BuildPlan {
            clang_cmd,
            output_path,
            output_temp,
            function_info,
            metal_pp_cmd,
            metal_final_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcapi::{DeviceType, HostCpuTier, UInt3, Vendor, VulkanVersion};

    fn host_toolchain() -> Toolchain {
        Toolchain {
            host: Some(ToolPaths {
                compiler: PathBuf::from("/opt/hc/host/bin/clang"),
                base_path: PathBuf::from("/opt/hc/host"),
                version: 140000,
            }),
            cuda: Some(ToolPaths {
                compiler: PathBuf::from("/opt/hc/cuda/bin/clang"),
                base_path: PathBuf::from("/opt/hc/cuda"),
                version: 140000,
            }),
            ..Toolchain::default()
        }
    }

    fn host_device() -> Device {
        Device {
            name: "host cpu".into(),
            vendor: Vendor::Intel,
            platform_vendor: Vendor::Intel,
            device_type: DeviceType::Cpu,
            units: 8,
            max_total_local_size: 1024,
            max_group_size: UInt3::splat(!0u32 >> 1),
            simd_width: 16,
            simd_range: (16, 16),
            backend: BackendInfo::Host { cpu_tier: HostCpuTier::X86Tier3 },
            ..Device::default()
        }
    }

    fn cuda_device(sm: (u32, u32)) -> Device {
        Device {
            name: "cuda gpu".into(),
            vendor: Vendor::Nvidia,
            platform_vendor: Vendor::Nvidia,
            device_type: DeviceType::Gpu,
            backend: BackendInfo::Cuda { sm, sm_aa: false },
            ..Device::default()
        }
    }

    #[test]
    fn host_command_carries_the_cpu_tier() {
        let tc = host_toolchain();
        let options = CompileOptions::new(Target::HostCompute);
        let plan = tc.assemble("\"kernel.cpp\"", "", &host_device(), &options, false).unwrap();
        assert!(plan.clang_cmd.contains("-x c++"));
        assert!(plan.clang_cmd.contains("-target x86_64-pc-none-hostcompute"));
        assert!(plan.clang_cmd.contains("-march=core-avx2"));
        assert!(plan.clang_cmd.contains("-mcmodel=large"));
        assert!(plan.clang_cmd.contains("-fPIC"));
        assert!(!plan.clang_cmd.contains(" -fno-pic"));
        assert!(plan.clang_cmd.contains("-Xclang -hc-function-info="));
        assert!(plan.clang_cmd.contains("-DHC_TOOLCHAIN_VERSION=140000u"));
        assert!(plan.clang_cmd.ends_with("2>&1"));
        assert!(plan.function_info.is_some());
        // host binaries are taken as-is, no -emit-llvm
        assert!(!plan.clang_cmd.contains("-emit-llvm"));
    }

    #[test]
    fn pch_builds_have_no_source_input_and_no_side_channel() {
        let tc = host_toolchain();
        let mut options = CompileOptions::new(Target::HostCompute);
        options.pch = Some(PathBuf::from("/tmp/common.pch"));
        let plan = tc.assemble("", "", &host_device(), &options, true).unwrap();
        assert!(plan.clang_cmd.contains("-x c++-header"));
        assert!(plan.function_info.is_none());
        assert!(!plan.clang_cmd.contains("hc-function-info"));
        assert!(plan.clang_cmd.contains("-o /tmp/common.pch"));
        assert!(plan.clang_cmd.contains("common.hpp\""));
    }

    #[test]
    fn missing_toolchain_is_reported() {
        let tc = Toolchain::default();
        let options = CompileOptions::new(Target::SpirvVulkan);
        let dev = Device {
            backend: BackendInfo::Vulkan {
                version: VulkanVersion::Vulkan1_3,
                float16_support: false,
                max_inline_uniform_block_size: 256,
                max_inline_uniform_block_count: 4,
                subgroup_uniform_cf_support: false,
                max_descriptor_set_count: 32,
            },
            ..Device::default()
        };
        let err = tc.assemble("-", "", &dev, &options, false).unwrap_err();
        assert!(matches!(err, ToolchainError::MissingToolchain("Vulkan")));
    }

    #[test]
    fn ptx_version_clamps_by_sm_tier() {
        let tc = host_toolchain();
        for (sm, min_ptx) in [((5, 0), 80u32), ((8, 8), 90), ((9, 0), 80), ((9, 2), 86),
                              ((10, 1), 86), ((10, 3), 88), ((11, 0), 90), ((12, 0), 87),
                              ((12, 1), 88), ((13, 0), 90)] {
            let options = CompileOptions::new(Target::Ptx);
            let plan = tc.assemble("-", "", &cuda_device(sm), &options, false).unwrap();
            assert!(
                plan.clang_cmd.contains(&format!("+ptx{min_ptx}")),
                "sm {sm:?} expected ptx {min_ptx} in: {}",
                plan.clang_cmd
            );
            assert!(plan.clang_cmd.contains(&format!("--cuda-gpu-arch=sm_{}{}",
                                                     sm.0 * 10 + sm.1,
                                                     if sm.0 >= 9 { "a" } else { "" })));
        }
    }

    #[test]
    fn device_backend_mismatch_is_rejected() {
        let tc = host_toolchain();
        let options = CompileOptions::new(Target::Ptx);
        let err = tc.assemble("-", "", &host_device(), &options, false).unwrap_err();
        assert!(matches!(err, ToolchainError::DeviceMismatch("CUDA")));
    }

    #[test]
    fn every_target_assembles() {
        use hcapi::{MetalFamily, MetalPlatform, MetalVersion, OpenClVersion, SpirvVersion};

        let paths = ToolPaths {
            compiler: PathBuf::from("/opt/hc/bin/clang"),
            base_path: PathBuf::from("/opt/hc"),
            version: 140000,
        };
        let tc = Toolchain {
            opencl: Some(paths.clone()),
            metal: Some(paths.clone()),
            cuda: Some(paths.clone()),
            vulkan: Some(paths.clone()),
            host: Some(paths),
            ..Toolchain::default()
        };

        for target in Target::ALL {
            let dev = match target {
                Target::Spir | Target::SpirvOpencl => Device {
                    backend: BackendInfo::OpenCl {
                        cl_version: OpenClVersion::Cl20,
                        spirv_version: Some(SpirvVersion::V1_4),
                    },
                    ..Device::default()
                },
                Target::Air => Device {
                    backend: BackendInfo::Metal {
                        platform: MetalPlatform::Macos,
                        family: MetalFamily::Mac,
                        language_version: MetalVersion::Metal3_1,
                        simd_reduction: true,
                    },
                    ..Device::default()
                },
                Target::Ptx => cuda_device((8, 6)),
                Target::SpirvVulkan => Device {
                    backend: BackendInfo::Vulkan {
                        version: VulkanVersion::Vulkan1_3,
                        float16_support: true,
                        max_inline_uniform_block_size: 256,
                        max_inline_uniform_block_count: 4,
                        subgroup_uniform_cf_support: false,
                        max_descriptor_set_count: 32,
                    },
                    ..Device::default()
                },
                Target::HostCompute => host_device(),
            };
            let options = CompileOptions::new(target);
            let plan = tc.assemble("-", "", &dev, &options, false)
                .unwrap_or_else(|e| panic!("target {target:?} failed to assemble: {e}"));
            assert!(plan.clang_cmd.contains("-DHC_TOOLCHAIN_VERSION=140000u"));
            assert!(plan.function_info.is_some());

            // PCH builds must also frame without source input
            let mut pch_options = CompileOptions::new(target);
            pch_options.pch = Some(PathBuf::from("/tmp/common.pch"));
            let pch_plan = tc.assemble("", "", &dev, &pch_options, true)
                .unwrap_or_else(|e| panic!("target {target:?} failed to assemble PCH: {e}"));
            assert!(pch_plan.clang_cmd.contains("-header"));
            assert!(pch_plan.function_info.is_none());
        }
    }

    #[test]
    fn source_code_is_hex_escaped_for_the_pipe() {
        assert_eq!(str_hex_escape("ab"), "\\x61\\x62");
    }

    #[test]
    fn error_markers_are_detected() {
        assert!(output_contains_errors("foo.cpp:1:1: error: unknown type"));
        assert!(output_contains_errors("2 errors: whatever"));
        assert!(!output_contains_errors("warning: something"));
    }
}
