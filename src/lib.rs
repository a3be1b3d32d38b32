pub mod core;
pub mod storage;
pub mod query;
pub mod lock;

/*
┌──────────────────────────────────────────────────────────────────────────────┐
│                          RECORDKEEP ARCHITECTURE                              │
└──────────────────────────────────────────────────────────────────────────────┘

   raw search text
        │
        ▼
┌──────────────────┐    ┌──────────────────┐    ┌──────────────────────────┐
│ GrammarMatcher   │───▶│ QueryCompiler    │───▶│ CompiledQuery            │
│ clause + term    │    │ alias → table    │    │ collection               │
│ regexes, all-or- │    │ field checks     │    │ conditions (fragment, ?) │
│ nothing consume  │    │ bound params     │    │ combinators AND / OR     │
└──────────────────┘    └──────────────────┘    └────────────┬─────────────┘
                                                             │ to_sql()
                                                             ▼
┌──────────────────────────── Database<S: RecordStore> ───────────────────────┐
│                                                                              │
│  AccessSerializer ── Box<dyn MutualExclusion>                                │
│     MarkerFileLock   <root>/.lock      create_new + poll, stale detection    │
│     FlockLock        <root>/.flock     flock(2)                              │
│                                                                              │
│  every query / execute / search runs inside one acquire ... release          │
│                                                                              │
│  ChangeLog           <root>/changes_log.json                                 │
│     notify: '\t' cases group, '\n' people, ' ' documents                     │
│     poll:   size > cursor ?                                                  │
│     ChangeWatcher: thread + cursor + crossbeam channel                       │
│                                                                              │
│  EditLockManager     <root>/edit_locks/edit_lock_<Collection>_<row>.lock     │
│     stage → thread polls, create_new, on_locked()                            │
│     release / cancel (CancellationToken)                                     │
└──────────────────────────────────────────────────────────────────────────────┘
*/
