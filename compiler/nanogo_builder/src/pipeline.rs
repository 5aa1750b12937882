//! The build pipeline.
//!
//! [`build`] drives a whole compilation: it fingerprints every package of
//! the loaded program, assembles the job graph (package compiles gated by
//! the bitcode cache, a link+optimize job, object emission, extra and CGo
//! file compiles gated by the C-file cache, runtime/libc builds, the final
//! link), runs it, and finishes with post-link stack-size patching and the
//! requested output conversion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use crate::cache::{cfile, package, BuildCache};
use crate::config::{output_extension, Config, OptLevel};
use crate::error::BuildError;
use crate::format::{self, BinaryFormat};
use crate::ir::{IrEngine, Linkage, OptPipeline, ProgramModule, SymbolHandle, Visibility};
use crate::jobs::{self, JobGraph, JobId};
use crate::program::Program;
use crate::stacksize::{self, SizeKind, StackAnalyzer, TaskStackSize};
use crate::tool;
use crate::elf;

/// The program initializer synthesized by the link job. The code generator
/// declares it; the link job fills its body with one call per package.
pub const PROGRAM_INIT_SYMBOL: &str = "runtime.initAll";

/// Location of the prebuilt wasi-libc archive below the toolchain root.
const WASI_LIBC_ARCHIVE: &str = "lib/wasi-libc/sysroot/lib/wasm32-wasi/libc.a";

/// The output of a build.
#[derive(Debug)]
pub struct BuildResult {
    /// Path to the produced binary. It is removed after [`build`] returns,
    /// so callers that want to keep it must copy or move it away inside the
    /// action callback.
    pub binary: PathBuf,
    /// Directory of the main package; test binaries must run from here.
    pub main_dir: PathBuf,
}

/// Compile `program` into `outpath`'s format and hand the result to
/// `action` while the intermediate files still exist.
///
/// The extension of `outpath` selects the output: `.o`, `.bc`, and `.ll`
/// stop after link+optimize and write the single artifact; anything else
/// produces a linked executable, optionally converted to a firmware
/// format.
pub fn build<'e>(
    program: &'e Program,
    outpath: &Path,
    config: &'e Config,
    engine: &'e dyn IrEngine,
    analyzer: &'e dyn StackAnalyzer,
    action: impl FnOnce(BuildResult) -> Result<(), BuildError>,
) -> Result<(), BuildError> {
    // An unknown optimization level must fail before any job is scheduled.
    let opt_pipeline = pass_pipeline(config.opt_level()?);

    // Scratch directory for intermediary files, removed on return.
    let scratch = tempfile::tempdir()
        .map_err(|e| BuildError::io(std::env::temp_dir(), e))?;
    let cache = BuildCache::resolve(&config.cache_dir, scratch.path());

    let compiler_config = config.compiler_config();
    let sorted = program.sorted();
    let auto_stack = config.automatic_stack_size();
    let print_ir = config.options.print_ir;
    let print_stacks = config.options.print_stacks;
    let ir_version = engine.version();

    // Output of the link+optimize job, consumed by object emission and the
    // post-link steps. Strictly sequenced through job dependencies.
    let module_slot: Mutex<Option<Box<dyn ProgramModule + 'e>>> = Mutex::new(None);
    let stack_size_loads: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let module_slot_ref = &module_slot;
    let loads_ref = &stack_size_loads;
    let cache_ref = &cache;
    let compiler_config_ref = &compiler_config;

    let mut graph = JobGraph::new();

    // Package compile jobs. Packages whose bitcode is already cached are
    // not compiled again; within this run the cache only grows.
    let mut package_jobs: Vec<JobId> = Vec::new();
    let mut bitcode_paths: Vec<PathBuf> = Vec::new();
    let mut action_digests: BTreeMap<String, String> = BTreeMap::new();
    for pkg in sorted {
        let key = package::PackageActionKey::assemble(
            pkg,
            compiler_config_ref,
            engine.codegen_version(),
            ir_version,
            &action_digests,
        )?;
        let digest = key.digest();
        action_digests.insert(pkg.import_path.clone(), digest.clone());

        let bitcode = package::bitcode_path(&cache, &digest);
        bitcode_paths.push(bitcode.clone());
        if bitcode.exists() {
            debug!("package {} already cached", pkg.import_path);
            continue;
        }

        let job = graph.add(
            format!("compile package {}", pkg.import_path),
            vec![],
            move |_| {
                let module = engine.compile_package(pkg, compiler_config_ref)?;
                if module.verify().is_err() {
                    return Err(BuildError::VerifyFailed {
                        stage: format!("compiling package {}", pkg.import_path),
                    });
                }
                package::publish_bitcode(cache_ref, &bitcode, module.as_ref())?;
                Ok(bitcode.to_string_lossy().into_owned())
            },
        );
        package_jobs.push(job);
    }

    // The link+optimize job: the optimizer sees the whole program at once.
    let link_job = graph.add("link+optimize packages (LTO)", package_jobs, move |_| {
        let mut module = engine.new_program_module()?;
        for path in &bitcode_paths {
            module.link_bitcode_file(path)?;
        }

        // Synthesize the program initializer: one call per package, in the
        // loader's sorted order.
        module.begin_program_init(PROGRAM_INIT_SYMBOL)?;
        for pkg in sorted {
            module.add_program_init_call(&format!("{}.init", pkg.import_path))?;
        }
        module.finish_program_init()?;

        tighten_linkage(module.as_mut());

        if print_ir {
            info!("; Generated IR:\n{}", module.ir_text());
        }

        optimize_program(module.as_mut(), &opt_pipeline)?;

        if auto_stack {
            // Recorded in slot order; the ELF patcher relies on it.
            *lock(loads_ref) = module.create_stack_size_loads();
        }
        *lock(module_slot_ref) = Some(module);
        Ok(String::new())
    });

    // Intermediate artifacts need no linking; emit and stop.
    let outext = output_extension(outpath);
    if matches!(outext.as_str(), ".o" | ".bc" | ".ll") {
        graph.run(jobs::default_workers())?;
        let module = lock(&module_slot)
            .take()
            .expect("link job did not run");
        let data = match outext.as_str() {
            ".o" => module.emit_object()?,
            ".bc" => module.bitcode()?,
            ".ll" => module.ir_text().into_bytes(),
            _ => unreachable!(),
        };
        return std::fs::write(outpath, data).map_err(|e| BuildError::io(outpath, e));
    }

    // From here on the driver produces a complete executable.
    let objfile = scratch.path().join("main.o");
    let output_object_job = {
        let objfile = objfile.clone();
        graph.add("generate output file", vec![link_job], move |_| {
            let slot = lock(module_slot_ref);
            let module = slot.as_ref().expect("link job did not run");
            let data = module.emit_object()?;
            std::fs::write(&objfile, data).map_err(|e| BuildError::io(&objfile, e))?;
            Ok(objfile.to_string_lossy().into_owned())
        })
    };

    let executable = scratch.path().join("main");
    let mut ldflags: Vec<String> = config.target.ldflags.clone();
    ldflags.push("-o".to_string());
    ldflags.push(executable.to_string_lossy().into_owned());

    let mut linker_deps = vec![output_object_job];
    let mut dep_descriptions = vec!["generate output file".to_string()];

    // Runtime support library, usually a cache load.
    if config.target.rtlib == "compiler-rt" {
        for source in &config.target.rtlib_files {
            let description = format!("compile compiler-rt file {source}");
            let job = add_compile_file_job(
                &mut graph,
                description.clone(),
                config.root_path(source),
                scratch.path().to_path_buf(),
                cache_ref,
                config.target.compiler.clone(),
                config.libc_cflags(),
                ir_version,
            );
            linker_deps.push(job);
            dep_descriptions.push(description);
        }
    }

    // C library selection.
    match config.target.libc.as_str() {
        "picolibc" => {
            for source in &config.target.libc_files {
                let description = format!("compile picolibc file {source}");
                let job = add_compile_file_job(
                    &mut graph,
                    description.clone(),
                    config.root_path(source),
                    scratch.path().to_path_buf(),
                    cache_ref,
                    config.target.compiler.clone(),
                    config.libc_cflags(),
                    ir_version,
                );
                linker_deps.push(job);
                dep_descriptions.push(description);
            }
        }
        "wasi-libc" => {
            let archive = config.root_path(WASI_LIBC_ARCHIVE);
            if !archive.exists() {
                return Err(BuildError::Other {
                    message: "could not find wasi-libc, perhaps you need to build it first"
                        .to_string(),
                });
            }
            ldflags.push(archive.to_string_lossy().into_owned());
        }
        "" => {}
        other => {
            return Err(BuildError::UnknownOption {
                option: "libc",
                value: other.to_string(),
            });
        }
    }

    // Extra files: interrupt vector tables, stack switching, and other low
    // level pieces written in C or assembly.
    for source in &config.target.extra_files {
        let description = format!("compile extra file {source}");
        let job = add_compile_file_job(
            &mut graph,
            description.clone(),
            config.root_path(source),
            scratch.path().to_path_buf(),
            cache_ref,
            config.target.compiler.clone(),
            config.cflags(),
            ir_version,
        );
        linker_deps.push(job);
        dep_descriptions.push(description);
    }

    // CGo C files of every package.
    // TODO: build these as part of the package job so their bitcode can be
    // linked with the rest of the program.
    for pkg in sorted {
        for filename in &pkg.c_files {
            let abspath = pkg.dir.join(filename);
            let description = format!("compile CGo file {}", abspath.display());
            let mut flags = config.cflags();
            flags.extend(pkg.cflags.iter().cloned());
            let job = add_compile_file_job(
                &mut graph,
                description.clone(),
                abspath,
                scratch.path().to_path_buf(),
                cache_ref,
                config.target.compiler.clone(),
                flags,
                ir_version,
            );
            linker_deps.push(job);
            dep_descriptions.push(description);
        }
    }

    // Linker flags from CGo directives.
    ldflags.extend(program.ld_flags.iter().cloned());

    // The final link, plus everything that can only happen once the
    // executable exists.
    {
        let linker = config.target.linker.clone();
        let executable = executable.clone();
        graph.add("link", linker_deps, move |results| {
            let mut ldflags = ldflags;
            for (result, description) in results.iter().zip(&dep_descriptions) {
                if result.is_empty() {
                    return Err(BuildError::Other {
                        message: format!("dependency without result: {description}"),
                    });
                }
                ldflags.push(result.clone());
            }
            debug!("{} {}", linker, ldflags.join(" "));
            tool::run(&linker, &ldflags).map_err(|e| BuildError::LinkerFailed {
                executable: executable.clone(),
                detail: e.to_string(),
            })?;

            if print_stacks || auto_stack {
                // Stack sizes can only be computed once the final layout is
                // known. Unsupported architectures surface their errors
                // here rather than silently producing garbage.
                let slot = lock(module_slot_ref);
                let module = slot.as_ref().expect("link job did not run");
                let (ordered, sizes) =
                    stacksize::determine_stack_sizes(module.as_ref(), analyzer, &executable)?;
                if auto_stack {
                    let loads = lock(loads_ref);
                    elf::patch_stack_sizes(&executable, &loads, &sizes)?;
                }
                if print_stacks {
                    report_stacks(&ordered, &sizes);
                }
            }
            Ok(executable.to_string_lossy().into_owned())
        });
    }

    graph.run(jobs::default_workers())?;

    // Convert the ELF to the requested firmware format, if any.
    let format_name = config.binary_format(&outext);
    let format =
        BinaryFormat::parse(&format_name).ok_or_else(|| BuildError::UnknownOption {
            option: "output binary format",
            value: format_name.clone(),
        })?;
    let binary = if format == BinaryFormat::Elf {
        executable
    } else {
        let converted = scratch.path().join(format!("main{outext}"));
        format::convert_executable(format, &executable, &converted, &config.target)?;
        converted
    };

    action(BuildResult {
        binary,
        main_dir: program.main_dir.clone(),
    })
}

/// Queue a cached C/assembly compile as a job.
#[allow(clippy::too_many_arguments)]
fn add_compile_file_job<'g>(
    graph: &mut JobGraph<'g>,
    description: String,
    abspath: PathBuf,
    scratch_dir: PathBuf,
    cache: &'g BuildCache,
    compiler: String,
    cflags: Vec<String>,
    ir_version: &'g str,
) -> JobId {
    graph.add(description, vec![], move |_| {
        let object = cfile::compile_and_cache_c_file(
            &abspath,
            &scratch_dir,
            cache,
            &compiler,
            &cflags,
            ir_version,
        )?;
        Ok(object.to_string_lossy().into_owned())
    })
}

/// Map an optimization level to pass-pipeline parameters, roughly matching
/// Clang's levels.
fn pass_pipeline(level: OptLevel) -> OptPipeline {
    match level {
        OptLevel::O1 => OptPipeline {
            speed_level: 1,
            size_level: 0,
            inliner_threshold: 0,
        },
        OptLevel::O2 => OptPipeline {
            speed_level: 2,
            size_level: 0,
            inliner_threshold: 225,
        },
        OptLevel::Os => OptPipeline {
            speed_level: 2,
            size_level: 1,
            inliner_threshold: 225,
        },
        OptLevel::Oz => OptPipeline {
            speed_level: 2,
            size_level: 2,
            inliner_threshold: 5,
        },
    }
}

/// After linking, non-exported symbols can be made internal so the
/// optimizer gets the full benefit of interprocedural analysis. The code
/// generator marks non-exported functions hidden, and thunks get
/// linkonce_odr linkage; both become internal here.
fn tighten_linkage(module: &mut dyn ProgramModule) {
    let mut tighten = |symbol: &mut dyn SymbolHandle| {
        if symbol.visibility() == Visibility::Hidden {
            symbol.set_visibility(Visibility::Default);
            symbol.set_linkage(Linkage::Internal);
        } else if symbol.linkage() == Linkage::LinkOnceOdr {
            symbol.set_linkage(Linkage::Internal);
        }
    };
    module.for_each_function(&mut tighten);
    module.for_each_global(&mut tighten);
}

/// Verify, run the configured passes, verify again.
fn optimize_program(
    module: &mut dyn ProgramModule,
    pipeline: &OptPipeline,
) -> Result<(), BuildError> {
    if module.verify().is_err() {
        return Err(BuildError::VerifyFailed {
            stage: "linking and initializer synthesis".to_string(),
        });
    }
    module.run_passes(pipeline)?;
    if module.verify().is_err() {
        return Err(BuildError::VerifyFailed {
            stage: "optimization passes".to_string(),
        });
    }
    Ok(())
}

/// Report the maximum stack depth of every started goroutine, as far as it
/// could be determined.
fn report_stacks(
    ordered: &[String],
    sizes: &rustc_hash::FxHashMap<String, TaskStackSize>,
) {
    info!("{:<32} stack usage (in bytes)", "function");
    for name in ordered {
        let Some(entry) = sizes.get(name) else { continue };
        let missing = entry.usage.missing_frame.as_deref().unwrap_or("a function");
        match entry.usage.kind {
            SizeKind::Bounded => {
                info!("{:<32} {}", entry.human_name, entry.usage.size);
            }
            SizeKind::Unknown => {
                info!(
                    "{:<32} unknown, {missing} does not have stack frame information",
                    entry.human_name
                );
            }
            SizeKind::Recursive => {
                info!("{:<32} recursive, {missing} may call itself", entry.human_name);
            }
            SizeKind::IndirectCall => {
                info!(
                    "{:<32} unknown, {missing} calls a function pointer",
                    entry.human_name
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
