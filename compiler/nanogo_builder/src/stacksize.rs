//! Goroutine stack-size determination.
//!
//! When automatic stack sizing is enabled the code generator gives every
//! goroutine a conservative default stack and records a sentinel load per
//! task in a dedicated section. After linking, this driver walks the IR
//! once to find goroutine wrappers and functions that call function
//! pointers, hands the linked executable to the stack analyzer, and
//! produces a bounded stack size per wrapper where the call graph allows
//! it. The ELF patcher then rewrites the section in place.

use std::path::Path;

use rustc_hash::FxHashMap;

use crate::elf;
use crate::error::BuildError;
use crate::ir::{Callee, ProgramModule};

/// String attribute marking a goroutine wrapper; its value is the
/// human-readable task name.
pub const TASK_WRAPPER_ATTR: &str = "tinygo-gowrapper";

/// The function whose frame is the baseline cost of starting and
/// suspending any task. Defined exactly once by the runtime.
pub const TASK_START_SYMBOL: &str = "tinygo_startTask";

/// Reset handler on ARM targets; runs startup code and the scheduler.
pub const ARM_RESET_HANDLER: &str = "Reset_Handler";

/// How much of a function's stack consumption could be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeKind {
    /// A worst-case stack size is known.
    Bounded,
    /// Some frame on the call path has no stack size information.
    Unknown,
    /// The function may call itself.
    Recursive,
    /// The function calls a function pointer.
    IndirectCall,
}

/// Stack usage of one symbol as reported by the analyzer.
#[derive(Debug, Clone)]
pub struct StackUsage {
    /// Worst-case stack size in bytes; meaningful only when `kind` is
    /// [`SizeKind::Bounded`].
    pub size: u64,
    pub kind: SizeKind,
    /// The frame that prevented a bounded result, if any.
    pub missing_frame: Option<String>,
}

/// Stack-size analysis of a linked executable, consumed as a library.
///
/// `call_graph` returns every definition of every symbol; a symbol name can
/// map to several definitions in a malformed link, which callers must treat
/// as an error.
pub trait StackAnalyzer: Sync {
    fn call_graph(
        &self,
        executable: &Path,
        indirect_callers: &[String],
    ) -> Result<FxHashMap<String, Vec<StackUsage>>, BuildError>;
}

/// Final stack-size verdict for one queried symbol.
#[derive(Debug, Clone)]
pub struct TaskStackSize {
    /// Human-readable task name shown in reports.
    pub human_name: String,
    pub usage: StackUsage,
}

/// Determine stack sizes for every started goroutine and for the reset
/// vector.
///
/// Returns the queried symbol names in report order (reset handler first on
/// ARM, then wrappers sorted by name) and the per-symbol verdicts.
pub fn determine_stack_sizes(
    module: &dyn ProgramModule,
    analyzer: &dyn StackAnalyzer,
    executable: &Path,
) -> Result<(Vec<String>, FxHashMap<String, TaskStackSize>), BuildError> {
    // One pass over the IR: collect functions that call function pointers
    // (their callees are invisible to the analyzer) and the goroutine
    // wrappers with their task names.
    let mut indirect_callers = Vec::new();
    let mut wrappers = Vec::new();
    for summary in module.function_summaries() {
        if summary.calls.contains(&Callee::Indirect) {
            indirect_callers.push(summary.name.clone());
        }
        if let Some(task_name) = summary.attribute(TASK_WRAPPER_ATTR) {
            let human_name = if task_name.is_empty() {
                summary.name.clone()
            } else {
                task_name.to_string()
            };
            wrappers.push((summary.name.clone(), human_name));
        }
    }
    wrappers.sort();

    let machine = elf::elf_machine(executable)?;
    let functions = analyzer.call_graph(executable, &indirect_callers)?;

    // Starting and suspending a task costs stack too; that baseline is the
    // frame of the task-startup function.
    let base = lookup_single(&functions, TASK_START_SYMBOL)?.clone();

    let mut sizes = FxHashMap::default();
    let mut ordered = Vec::new();

    // The reset handler is reported for convenience on ARM. Interrupts run
    // on this stack as well, so the listed size is a lower bound.
    let reset_function = match machine {
        goblin::elf::header::EM_ARM => Some(ARM_RESET_HANDLER),
        _ => None,
    };
    if let Some(reset) = reset_function {
        let usage = lookup_single(&functions, reset)?.clone();
        sizes.insert(
            reset.to_string(),
            TaskStackSize {
                human_name: reset.to_string(),
                usage,
            },
        );
        ordered.push(reset.to_string());
    }

    for (name, human_name) in wrappers {
        let mut usage = lookup_single(&functions, &name)?.clone();
        if base.kind != SizeKind::Bounded {
            // Without a bounded task-startup frame nothing can be bounded;
            // this happens at low optimization levels.
            usage.kind = base.kind;
            usage.missing_frame.clone_from(&base.missing_frame);
        } else if usage.size < base.size {
            // A tiny goroutine still needs room for every register pushed
            // when it is started and suspended.
            usage.size = base.size;
        }
        sizes.insert(name.clone(), TaskStackSize { human_name, usage });
        ordered.push(name);
    }

    Ok((ordered, sizes))
}

/// The call graph is expected to hold exactly one definition per queried
/// symbol; anything else is a fatal inconsistency.
fn lookup_single<'m>(
    functions: &'m FxHashMap<String, Vec<StackUsage>>,
    name: &str,
) -> Result<&'m StackUsage, BuildError> {
    let defs = functions.get(name).map(Vec::as_slice).unwrap_or_default();
    match defs {
        [single] => Ok(single),
        _ => Err(BuildError::MissingSymbol {
            symbol: name.to_string(),
            found: defs.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::elf_fixtures::minimal_elf;
    use crate::ir::{FunctionSummary, OptPipeline, SymbolHandle};
    use std::path::PathBuf;

    /// Module stub exposing only function summaries.
    struct SummaryModule(Vec<FunctionSummary>);

    impl ProgramModule for SummaryModule {
        fn link_bitcode_file(&mut self, _: &Path) -> Result<(), BuildError> {
            unimplemented!()
        }
        fn begin_program_init(&mut self, _: &str) -> Result<(), BuildError> {
            unimplemented!()
        }
        fn add_program_init_call(&mut self, _: &str) -> Result<(), BuildError> {
            unimplemented!()
        }
        fn finish_program_init(&mut self) -> Result<(), BuildError> {
            unimplemented!()
        }
        fn for_each_function(&mut self, _: &mut dyn FnMut(&mut dyn SymbolHandle)) {
            unimplemented!()
        }
        fn for_each_global(&mut self, _: &mut dyn FnMut(&mut dyn SymbolHandle)) {
            unimplemented!()
        }
        fn verify(&self) -> Result<(), BuildError> {
            unimplemented!()
        }
        fn run_passes(&mut self, _: &OptPipeline) -> Result<(), BuildError> {
            unimplemented!()
        }
        fn create_stack_size_loads(&mut self) -> Vec<String> {
            unimplemented!()
        }
        fn function_summaries(&self) -> Vec<FunctionSummary> {
            self.0.clone()
        }
        fn ir_text(&self) -> String {
            unimplemented!()
        }
        fn bitcode(&self) -> Result<Vec<u8>, BuildError> {
            unimplemented!()
        }
        fn emit_object(&self) -> Result<Vec<u8>, BuildError> {
            unimplemented!()
        }
    }

    struct MapAnalyzer {
        functions: FxHashMap<String, Vec<StackUsage>>,
        expected_indirect: Vec<String>,
    }

    impl StackAnalyzer for MapAnalyzer {
        fn call_graph(
            &self,
            _executable: &Path,
            indirect_callers: &[String],
        ) -> Result<FxHashMap<String, Vec<StackUsage>>, BuildError> {
            assert_eq!(indirect_callers, self.expected_indirect.as_slice());
            Ok(self.functions.clone())
        }
    }

    fn bounded(size: u64) -> Vec<StackUsage> {
        vec![StackUsage {
            size,
            kind: SizeKind::Bounded,
            missing_frame: None,
        }]
    }

    fn wrapper(name: &str, task: &str) -> FunctionSummary {
        FunctionSummary {
            name: name.to_string(),
            calls: vec![Callee::Direct],
            attributes: vec![(TASK_WRAPPER_ATTR.to_string(), task.to_string())],
        }
    }

    fn arm_executable(dir: &Path) -> PathBuf {
        let path = dir.join("firmware.elf");
        std::fs::write(&path, minimal_elf(goblin::elf::header::EM_ARM, &[0u8; 4])).unwrap();
        path
    }

    #[test]
    fn test_small_wrapper_is_raised_to_startup_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let executable = arm_executable(dir.path());

        let module = SummaryModule(vec![
            wrapper("main.led$gowrapper", "main.led"),
            FunctionSummary {
                name: "runtime.run".to_string(),
                calls: vec![Callee::Direct, Callee::Indirect],
                attributes: vec![],
            },
        ]);

        let mut functions = FxHashMap::default();
        functions.insert(TASK_START_SYMBOL.to_string(), bounded(48));
        functions.insert(ARM_RESET_HANDLER.to_string(), bounded(316));
        functions.insert("main.led$gowrapper".to_string(), bounded(16));

        let analyzer = MapAnalyzer {
            functions,
            expected_indirect: vec!["runtime.run".to_string()],
        };

        let (ordered, sizes) =
            determine_stack_sizes(&module, &analyzer, &executable).unwrap();
        assert_eq!(ordered, [ARM_RESET_HANDLER, "main.led$gowrapper"]);

        let led = &sizes["main.led$gowrapper"];
        assert_eq!(led.human_name, "main.led");
        assert_eq!(led.usage.kind, SizeKind::Bounded);
        // 16 bytes of own frame, raised to the 48-byte startup baseline.
        assert_eq!(led.usage.size, 48);
        assert_eq!(sizes[ARM_RESET_HANDLER].usage.size, 316);
    }

    #[test]
    fn test_unbounded_startup_propagates_to_all_wrappers() {
        let dir = tempfile::tempdir().unwrap();
        let executable = arm_executable(dir.path());

        let module = SummaryModule(vec![wrapper("main.worker$gowrapper", "main.worker")]);

        let mut functions = FxHashMap::default();
        functions.insert(
            TASK_START_SYMBOL.to_string(),
            vec![StackUsage {
                size: 0,
                kind: SizeKind::Unknown,
                missing_frame: Some("tinygo_swapTask".to_string()),
            }],
        );
        functions.insert(ARM_RESET_HANDLER.to_string(), bounded(100));
        functions.insert("main.worker$gowrapper".to_string(), bounded(512));

        let analyzer = MapAnalyzer {
            functions,
            expected_indirect: vec![],
        };

        let (_, sizes) = determine_stack_sizes(&module, &analyzer, &executable).unwrap();
        let worker = &sizes["main.worker$gowrapper"];
        assert_eq!(worker.usage.kind, SizeKind::Unknown);
        assert_eq!(worker.usage.missing_frame.as_deref(), Some("tinygo_swapTask"));
    }

    #[test]
    fn test_missing_startup_symbol_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let executable = arm_executable(dir.path());

        let module = SummaryModule(vec![]);
        let analyzer = MapAnalyzer {
            functions: FxHashMap::default(),
            expected_indirect: vec![],
        };

        let err = determine_stack_sizes(&module, &analyzer, &executable).unwrap_err();
        match err {
            BuildError::MissingSymbol { symbol, found } => {
                assert_eq!(symbol, TASK_START_SYMBOL);
                assert_eq!(found, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_wrapper_definition_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let executable = arm_executable(dir.path());

        let module = SummaryModule(vec![wrapper("main.twice$gowrapper", "")]);

        let mut functions = FxHashMap::default();
        functions.insert(TASK_START_SYMBOL.to_string(), bounded(48));
        functions.insert(ARM_RESET_HANDLER.to_string(), bounded(100));
        let mut dup = bounded(64);
        dup.extend(bounded(72));
        functions.insert("main.twice$gowrapper".to_string(), dup);

        let analyzer = MapAnalyzer {
            functions,
            expected_indirect: vec![],
        };

        let err = determine_stack_sizes(&module, &analyzer, &executable).unwrap_err();
        assert!(matches!(
            err,
            BuildError::MissingSymbol { found: 2, .. }
        ));
    }

    #[test]
    fn test_wrapper_without_task_name_falls_back_to_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let executable = arm_executable(dir.path());

        let module = SummaryModule(vec![wrapper("main.anon$gowrapper", "")]);

        let mut functions = FxHashMap::default();
        functions.insert(TASK_START_SYMBOL.to_string(), bounded(48));
        functions.insert(ARM_RESET_HANDLER.to_string(), bounded(100));
        functions.insert("main.anon$gowrapper".to_string(), bounded(96));

        let analyzer = MapAnalyzer {
            functions,
            expected_indirect: vec![],
        };

        let (_, sizes) = determine_stack_sizes(&module, &analyzer, &executable).unwrap();
        assert_eq!(sizes["main.anon$gowrapper"].human_name, "main.anon$gowrapper");
    }
}
