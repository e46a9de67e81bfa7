// Credits: https://github.com/datenlord/rdma-sys/blob/master/build.rs

use std::env;
use std::path::Path;

fn main() {
    println!("cargo:rustc-link-lib=ibverbs");
    println!("cargo:rerun-if-changed=src/bindings.h");

    let bindings = bindgen::Builder::default()
        .clang_arg("-I/usr/include")
        .header("src/bindings.h")
        .whitelist_function("ibv_.*")
        .whitelist_type("ibv_.*")
        // used with bitwise-or
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_create_cq_wc_flags")
        .bitfield_enum("ibv_wc_flags")
        .bitfield_enum("ibv_qp_init_attr_mask")
        .bitfield_enum("ibv_qp_create_flags")
        .constified_enum_module("ibv_qp_attr_mask")
        .constified_enum_module("ibv_send_flags")
        // plain value sets, kept as consts in a sub-mod
        .constified_enum_module("ibv_mtu")
        .constified_enum_module("ibv_port_state")
        .constified_enum_module("ibv_wc_status")
        .constified_enum_module("ibv_wc_opcode")
        .constified_enum_module("ibv_qp_type")
        .constified_enum_module("ibv_qp_state")
        .constified_enum_module("ibv_mig_state")
        .constified_enum_module("ibv_wr_opcode")
        // unions with non-`Copy` fields other than `ManuallyDrop<T>` are unstable
        .derive_copy(true)
        .derive_debug(false)
        .derive_default(false)
        .generate_comments(false)
        .prepend_enum_name(false)
        .rustfmt_bindings(true)
        .size_t_is_usize(true)
        .disable_untagged_union()
        .generate()
        .expect("Unable to generate bindings");

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    let dest_path = Path::new(&out_dir).join("bindings.rs");

    bindings
        .write_to_file(dest_path)
        .expect("Could not write bindings");
}
