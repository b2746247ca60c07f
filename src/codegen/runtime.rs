//! Runtime library text printed ahead of generated code. Each section is
//! emitted in the order `emit_program` lists them; later sections only
//! depend on earlier ones.

pub(crate) const RUNTIME_HEADER_C: &str = r#"#include <stdint.h>
#include <stdio.h>
#include <stdlib.h>

typedef struct Obj {
    int rc;
    int mark;
    int scc_id;
    int is_pair;
    union {
        long i;
        struct {
            struct Obj* a;
            struct Obj* b;
        };
    };
} Obj;

static Obj STACK_POOL[STACK_POOL_SIZE];
static int STACK_PTR = 0;

static int is_stack_obj(Obj* x) {
    uintptr_t p = (uintptr_t)x;
    uintptr_t lo = (uintptr_t)&STACK_POOL[0];
    uintptr_t hi = (uintptr_t)&STACK_POOL[STACK_POOL_SIZE];
    return p >= lo && p < hi;
}

static Obj* init_int(Obj* x, long i) {
    x->rc = 1;
    x->mark = 0;
    x->scc_id = -1;
    x->is_pair = 0;
    x->i = i;
    return x;
}

static Obj* init_pair(Obj* x, Obj* a, Obj* b) {
    x->rc = 1;
    x->mark = 0;
    x->scc_id = -1;
    x->is_pair = 1;
    x->a = a;
    x->b = b;
    return x;
}

static Obj* mk_int(long i) {
    Obj* x = malloc(sizeof(Obj));
    if (!x) {
        fprintf(stderr, "out of memory\n");
        exit(1);
    }
    return init_int(x, i);
}

static Obj* mk_pair(Obj* a, Obj* b) {
    Obj* x = malloc(sizeof(Obj));
    if (!x) {
        fprintf(stderr, "out of memory\n");
        exit(1);
    }
    return init_pair(x, a, b);
}

static Obj* mk_int_stack(long i) {
    if (STACK_PTR < STACK_POOL_SIZE) {
        return init_int(&STACK_POOL[STACK_PTR++], i);
    }
    return mk_int(i);
}

typedef struct FreeNode {
    Obj* obj;
    struct FreeNode* next;
} FreeNode;

static FreeNode* FREE_LIST = NULL;

static void defer_free(Obj* x) {
    FreeNode* n;
    if (!x || is_stack_obj(x)) return;
    n = malloc(sizeof(FreeNode));
    if (!n) {
        free(x);
        return;
    }
    n->obj = x;
    n->next = FREE_LIST;
    FREE_LIST = n;
}

/* defined with the helpers, called by type scanners */
static Obj* scan_obj(Obj* x);
"#;

pub(crate) const FREE_ROUTINES_C: &str = r#"
/* Shape-dispatched release */
static void free_tree(Obj* x) {
    if (!x || is_stack_obj(x)) return;
    if (x->is_pair) {
        free_tree(x->a);
        free_tree(x->b);
    }
    free(x);
}

static void inc_ref(Obj* x) {
    if (x && !is_stack_obj(x)) x->rc++;
}

static void dec_ref(Obj* x) {
    if (!x || is_stack_obj(x)) return;
    if (--x->rc > 0) return;
    if (x->is_pair) {
        dec_ref(x->a);
        dec_ref(x->b);
    }
    free(x);
}

static void free_unique(Obj* x) {
    if (!x || is_stack_obj(x)) return;
    if (x->is_pair) {
        dec_ref(x->a);
        dec_ref(x->b);
    }
    free(x);
}

static void flush_freelist(void) {
    while (FREE_LIST) {
        FreeNode* n = FREE_LIST;
        FREE_LIST = n->next;
        dec_ref(n->obj);
        free(n);
    }
}
"#;

pub(crate) const WEAK_C: &str = r#"
/* Weak references */
typedef struct WeakRef {
    void* target;
    int alive;
} WeakRef;

typedef struct WeakNode {
    WeakRef* ref;
    struct WeakNode* next;
} WeakNode;

static WeakNode* WEAK_REFS = NULL;

static WeakRef* mk_weak_ref(void* target) {
    WeakRef* w = malloc(sizeof(WeakRef));
    WeakNode* n = malloc(sizeof(WeakNode));
    if (!w || !n) {
        fprintf(stderr, "out of memory\n");
        exit(1);
    }
    w->target = target;
    w->alive = 1;
    n->ref = w;
    n->next = WEAK_REFS;
    WEAK_REFS = n;
    return w;
}

static void* deref_weak(WeakRef* w) {
    return (w && w->alive) ? w->target : NULL;
}

static void invalidate_weak(WeakRef* w) {
    if (w) w->alive = 0;
}

static void cleanup_weak_refs(void) {
    while (WEAK_REFS) {
        WeakNode* n = WEAK_REFS;
        WEAK_REFS = n->next;
        free(n->ref);
        free(n);
    }
}
"#;

pub(crate) const REUSE_C: &str = r#"
/* Perceus reuse */
static Obj* try_reuse(Obj* old, size_t size) {
    (void)size;
    if (old && !is_stack_obj(old) && old->rc == 1) {
        if (old->is_pair) {
            dec_ref(old->a);
            dec_ref(old->b);
        }
        return old;
    }
    dec_ref(old);
    return NULL;
}

static Obj* reuse_as_int(Obj* slot, long i) {
    return slot ? init_int(slot, i) : mk_int(i);
}

static Obj* reuse_as_pair(Obj* slot, Obj* a, Obj* b) {
    return slot ? init_pair(slot, a, b) : mk_pair(a, b);
}
"#;

pub(crate) const SCC_C: &str = r#"
/* Frozen strongly connected components */
typedef struct SccGroup {
    Obj** members;
    int count;
    int rc;
} SccGroup;

static SccGroup* SCCS = NULL;
static int SCC_COUNT = 0;
static int SCC_CAP = 0;

typedef struct TarjanNode {
    Obj* obj;
    int index;
    int low;
    int on_stack;
} TarjanNode;

static TarjanNode* TJ = NULL;
static int TJ_COUNT = 0;
static int TJ_CAP = 0;
static int* TJ_STACK = NULL;
static int TJ_TOP = 0;

static int tj_find(Obj* x) {
    for (int i = 0; i < TJ_COUNT; i++) {
        if (TJ[i].obj == x) return i;
    }
    return -1;
}

static int tj_add(Obj* x) {
    if (TJ_COUNT == TJ_CAP) {
        TJ_CAP = TJ_CAP ? TJ_CAP * 2 : 16;
        TJ = realloc(TJ, sizeof(TarjanNode) * TJ_CAP);
        TJ_STACK = realloc(TJ_STACK, sizeof(int) * TJ_CAP);
        if (!TJ || !TJ_STACK) {
            fprintf(stderr, "out of memory\n");
            exit(1);
        }
    }
    TJ[TJ_COUNT].obj = x;
    TJ[TJ_COUNT].index = TJ_COUNT;
    TJ[TJ_COUNT].low = TJ_COUNT;
    TJ[TJ_COUNT].on_stack = 1;
    TJ_STACK[TJ_TOP++] = TJ_COUNT;
    return TJ_COUNT++;
}

static int scc_new_group(void) {
    if (SCC_COUNT == SCC_CAP) {
        SCC_CAP = SCC_CAP ? SCC_CAP * 2 : 8;
        SCCS = realloc(SCCS, sizeof(SccGroup) * SCC_CAP);
        if (!SCCS) {
            fprintf(stderr, "out of memory\n");
            exit(1);
        }
    }
    SCCS[SCC_COUNT].members = NULL;
    SCCS[SCC_COUNT].count = 0;
    SCCS[SCC_COUNT].rc = 0;
    return SCC_COUNT++;
}

static void scc_add_member(int id, Obj* x) {
    SccGroup* g = &SCCS[id];
    g->members = realloc(g->members, sizeof(Obj*) * (g->count + 1));
    if (!g->members) {
        fprintf(stderr, "out of memory\n");
        exit(1);
    }
    g->members[g->count++] = x;
    x->scc_id = id;
}

static int tarjan(Obj* v) {
    int vi = tj_add(v);
    Obj* kids[2];
    kids[0] = v->is_pair ? v->a : NULL;
    kids[1] = v->is_pair ? v->b : NULL;
    for (int k = 0; k < 2; k++) {
        Obj* w = kids[k];
        int wi;
        if (!w || is_stack_obj(w)) continue;
        wi = tj_find(w);
        if (wi < 0) {
            wi = tarjan(w);
            if (TJ[wi].low < TJ[vi].low) TJ[vi].low = TJ[wi].low;
        } else if (TJ[wi].on_stack && TJ[wi].index < TJ[vi].low) {
            TJ[vi].low = TJ[wi].index;
        }
    }
    if (TJ[vi].low == TJ[vi].index) {
        int id = scc_new_group();
        int wi;
        do {
            wi = TJ_STACK[--TJ_TOP];
            TJ[wi].on_stack = 0;
            scc_add_member(id, TJ[wi].obj);
        } while (wi != vi);
    }
    return vi;
}

static Obj* freeze_cyclic(Obj* root) {
    int first = SCC_COUNT;
    if (!root || is_stack_obj(root) || root->scc_id >= 0) return root;
    TJ_COUNT = 0;
    TJ_TOP = 0;
    tarjan(root);
    for (int id = first; id < SCC_COUNT; id++) {
        for (int m = 0; m < SCCS[id].count; m++) {
            Obj* x = SCCS[id].members[m];
            if (!x->is_pair) continue;
            if (x->a && x->a->scc_id >= first && x->a->scc_id != id) SCCS[x->a->scc_id].rc++;
            if (x->b && x->b->scc_id >= first && x->b->scc_id != id) SCCS[x->b->scc_id].rc++;
        }
    }
    SCCS[root->scc_id].rc++;
    return root;
}

static void inc_scc_ref(int id) {
    if (id >= 0 && id < SCC_COUNT) SCCS[id].rc++;
}

static void release_scc(int id) {
    SccGroup* g;
    if (id < 0 || id >= SCC_COUNT) return;
    g = &SCCS[id];
    if (g->count == 0 || --g->rc > 0) return;
    for (int m = 0; m < g->count; m++) {
        Obj* x = g->members[m];
        Obj* kids[2];
        if (!x->is_pair) continue;
        kids[0] = x->a;
        kids[1] = x->b;
        for (int k = 0; k < 2; k++) {
            Obj* w = kids[k];
            if (!w) continue;
            if (w->scc_id < 0) dec_ref(w);
            else if (w->scc_id != id) release_scc(w->scc_id);
        }
    }
    for (int m = 0; m < g->count; m++) {
        if (!is_stack_obj(g->members[m])) free(g->members[m]);
    }
    free(g->members);
    g->members = NULL;
    g->count = 0;
}
"#;

pub(crate) const DEFERRED_C: &str = r#"
/* Deferred release, bounded work per safe point */
typedef struct DeferredEntry {
    Obj* obj;
    int count;
    struct DeferredEntry* next;
} DeferredEntry;

static DeferredEntry* DEFERRED_HEAD = NULL;
static DeferredEntry* DEFERRED_TAIL = NULL;
static int DEFERRED_PENDING = 0;
static long TOTAL_DEFERRED = 0;

static void deferred_release(Obj* x) {
    DeferredEntry* e;
    if (!x || is_stack_obj(x)) return;
    for (e = DEFERRED_HEAD; e; e = e->next) {
        if (e->obj == x) {
            e->count++;
            return;
        }
    }
    e = malloc(sizeof(DeferredEntry));
    if (!e) {
        dec_ref(x);
        return;
    }
    e->obj = x;
    e->count = 1;
    e->next = NULL;
    if (DEFERRED_TAIL) DEFERRED_TAIL->next = e;
    else DEFERRED_HEAD = e;
    DEFERRED_TAIL = e;
    DEFERRED_PENDING++;
    TOTAL_DEFERRED++;
}

static void safe_point(void) {
    int budget = DEFERRED_BATCH_SIZE;
    while (budget-- > 0 && DEFERRED_HEAD) {
        DeferredEntry* e = DEFERRED_HEAD;
        dec_ref(e->obj);
        if (--e->count == 0) {
            DEFERRED_HEAD = e->next;
            if (!DEFERRED_HEAD) DEFERRED_TAIL = NULL;
            DEFERRED_PENDING--;
            free(e);
        }
    }
}

static void flush_deferred(void) {
    while (DEFERRED_HEAD) safe_point();
}
"#;

pub(crate) const DPS_C: &str = r#"
/* Destination passing */
typedef struct Dest {
    Obj** ptr;
    int on_stack;
} Dest;

static Obj* write_int(Dest d, long i) {
    Obj* x = d.on_stack ? mk_int_stack(i) : mk_int(i);
    if (d.ptr) *d.ptr = x;
    return x;
}

static Obj* write_pair(Dest d, Obj* a, Obj* b) {
    Obj* x = mk_pair(a, b);
    if (d.ptr) *d.ptr = x;
    return x;
}

static int map_dps(Obj* list, long (*f)(long), Dest* dests, int n) {
    int i = 0;
    while (list && list->is_pair && i < n) {
        write_int(dests[i], f(list->a ? list->a->i : 0));
        list = list->b;
        i++;
    }
    return i;
}

static Obj* fold_dps(Obj* list, long init, long (*f)(long, long), Dest d) {
    long acc = init;
    while (list && list->is_pair) {
        acc = f(acc, list->a ? list->a->i : 0);
        list = list->b;
    }
    return write_int(d, acc);
}
"#;

pub(crate) const HELPERS_C: &str = r#"
/* Primitive helpers */
static long int_of(Obj* x) {
    return (x && !x->is_pair) ? x->i : 0;
}

static int is_true(Obj* x) {
    return x && (x->is_pair || x->i != 0);
}

static Obj* add(Obj* a, Obj* b) { return mk_int(int_of(a) + int_of(b)); }
static Obj* sub(Obj* a, Obj* b) { return mk_int(int_of(a) - int_of(b)); }
static Obj* mul(Obj* a, Obj* b) { return mk_int(int_of(a) * int_of(b)); }

static Obj* div_op(Obj* a, Obj* b) {
    if (int_of(b) == 0) {
        fprintf(stderr, "division by zero\n");
        return mk_int(0);
    }
    return mk_int(int_of(a) / int_of(b));
}

static Obj* mod_op(Obj* a, Obj* b) {
    if (int_of(b) == 0) {
        fprintf(stderr, "division by zero\n");
        return mk_int(0);
    }
    return mk_int(int_of(a) % int_of(b));
}

static Obj* lt_op(Obj* a, Obj* b) { return mk_int(int_of(a) < int_of(b)); }
static Obj* gt_op(Obj* a, Obj* b) { return mk_int(int_of(a) > int_of(b)); }
static Obj* le_op(Obj* a, Obj* b) { return mk_int(int_of(a) <= int_of(b)); }
static Obj* ge_op(Obj* a, Obj* b) { return mk_int(int_of(a) >= int_of(b)); }
static Obj* num_eq(Obj* a, Obj* b) { return mk_int(int_of(a) == int_of(b)); }
static Obj* not_op(Obj* a) { return mk_int(!is_true(a)); }
static Obj* is_nil(Obj* a) { return mk_int(a == NULL); }
static Obj* is_pair(Obj* a) { return mk_int(a != NULL && a->is_pair); }

static Obj* eq_op(Obj* a, Obj* b) {
    if (a == b) return mk_int(1);
    if (a && b && !a->is_pair && !b->is_pair) return mk_int(a->i == b->i);
    return mk_int(0);
}

static Obj* car(Obj* x) {
    if (!x || !x->is_pair) {
        fprintf(stderr, "car of non-cons\n");
        return NULL;
    }
    return x->a;
}

static Obj* cdr(Obj* x) {
    if (!x || !x->is_pair) {
        fprintf(stderr, "cdr of non-cons\n");
        return NULL;
    }
    return x->b;
}

static void scan_mark(Obj* x, int mark) {
    while (x && x->mark != mark) {
        x->mark = mark;
        if (!x->is_pair) return;
        scan_mark(x->a, mark);
        x = x->b;
    }
}

static Obj* scan_obj(Obj* x) {
    scan_mark(x, 1);
    scan_mark(x, 0);
    return x;
}

static void print_obj(Obj* x) {
    if (!x) {
        printf("()");
        return;
    }
    if (!x->is_pair) {
        printf("%ld", x->i);
        return;
    }
    printf("(");
    print_obj(x->a);
    x = x->b;
    while (x && x->is_pair) {
        printf(" ");
        print_obj(x->a);
        x = x->b;
    }
    if (x) {
        printf(" . ");
        print_obj(x);
    }
    printf(")");
}
"#;

/// Sections in program order, after the configuration defines
pub(crate) const RUNTIME_SECTIONS: [(&str, &str); 7] = [
    ("runtime header", RUNTIME_HEADER_C),
    ("free routines", FREE_ROUTINES_C),
    ("weak references", WEAK_C),
    ("reuse", REUSE_C),
    ("scc", SCC_C),
    ("deferred release", DEFERRED_C),
    ("destination passing", DPS_C),
];

/// Every runtime symbol generated code may call
pub(crate) const RUNTIME_SYMBOLS: &[&str] = &[
    "Obj", "Dest", "WeakRef", "mk_int", "mk_pair", "mk_int_stack", "init_int", "init_pair",
    "is_stack_obj", "defer_free", "free_tree", "inc_ref", "dec_ref", "free_unique",
    "flush_freelist", "mk_weak_ref", "deref_weak", "invalidate_weak", "cleanup_weak_refs",
    "try_reuse", "reuse_as_int", "reuse_as_pair", "freeze_cyclic", "inc_scc_ref", "release_scc",
    "tarjan", "deferred_release", "safe_point", "flush_deferred", "write_int", "write_pair",
    "map_dps", "fold_dps", "int_of", "is_true", "add", "sub", "mul", "div_op", "mod_op", "lt_op",
    "gt_op", "le_op", "ge_op", "num_eq", "not_op", "is_nil", "is_pair", "eq_op", "car", "cdr",
    "scan_mark", "scan_obj", "print_obj", "main", "result",
];
